//! APS controller wrapper and ZCL Default Response coordinator
//!
//! The wrapper intercepts every outgoing APS-DATA.request so that
//! (a) in-flight requests can be counted system-wide and per device and
//! (b) during the handling of a ZCL indication a watchdog can observe
//! whether a specific response was produced. When the indication scope
//! ends without one, the watchdog emits a ZCL Default Response: exactly
//! one per eligible request.

use zigbee_aps::zcl::{zcl_command, ZCL_FC_DIRECTION_SERVER_TO_CLIENT, ZCL_FC_DISABLE_DEFAULT_RESPONSE, ZCL_FC_MANUFACTURER_SPECIFIC, ZCL_FC_PROFILE_COMMAND};
use zigbee_aps::{
    clusters, profiles, Address, AddressMode, ApsController, ApsDataIndication, ApsDataRequest,
    ApsError, Node, ZclFrame,
};

use crate::clock::SteadyTime;

/// Narrow send interface the state machines use. Implemented by
/// `ApsCtrlWrapper` so everything funnels through the same observation
/// point.
pub trait ApsSend {
    fn send(&mut self, req: &ApsDataRequest) -> Result<u8, ApsError>;
    fn next_zcl_sequence(&mut self) -> u8;
    fn unconfirmed_requests(&self) -> usize;
    fn unconfirmed_for_ext(&self, ext: u64) -> usize;
    fn node_for_ext(&self, ext: u64) -> Option<Node>;
    fn node_at(&self, index: usize) -> Option<Node>;
}

#[derive(Debug, Clone, Copy)]
struct UnconfirmedRequest {
    id: u8,
    dst_ext: u64,
    sent_at: SteadyTime,
}

/// Requests unconfirmed for longer than this are considered lost.
const UNCONFIRMED_EXPIRY_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderState {
    Init,
    NoResponseNeeded,
    Watch,
    HasResponse,
}

/// Watchdog for one inbound ZCL indication.
#[derive(Debug)]
pub struct ZclDefaultResponder {
    state: ResponderState,
    src_address: Address,
    src_endpoint: u8,
    dst_endpoint: u8,
    dst_addr_mode: AddressMode,
    profile_id: u16,
    cluster_id: u16,
    frame_control: u8,
    manufacturer_code: u16,
    sequence_number: u8,
    command_id: u8,
}

impl ZclDefaultResponder {
    fn new(ind: &ApsDataIndication, frame: &ZclFrame) -> Self {
        // ZCL only; OTA commands are answered by the OTA layer
        let state = if ind.profile_id != profiles::ZDP && ind.cluster_id != clusters::OTAU {
            ResponderState::Watch
        } else {
            ResponderState::Init
        };

        Self {
            state,
            src_address: ind.src_address,
            src_endpoint: ind.src_endpoint,
            dst_endpoint: ind.dst_endpoint,
            dst_addr_mode: ind.dst_addr_mode,
            profile_id: ind.profile_id,
            cluster_id: ind.cluster_id,
            frame_control: frame.frame_control,
            manufacturer_code: frame.manufacturer_code,
            sequence_number: frame.sequence_number,
            command_id: frame.command_id,
        }
    }

    fn need_default_response(&self) -> bool {
        if self.frame_control & 0x03 == ZCL_FC_PROFILE_COMMAND
            && self.command_id == zcl_command::DEFAULT_RESPONSE
        {
            return false;
        }

        // only respond to unicast
        if self.dst_addr_mode != AddressMode::Nwk && self.dst_addr_mode != AddressMode::NwkAndIeee {
            return false;
        }

        self.frame_control & ZCL_FC_DISABLE_DEFAULT_RESPONSE == 0
    }

    /// Returns true when \p req is a specific or default response to the
    /// watched indication: same destination, profile, cluster and ZCL
    /// sequence number. Command ids may legitimately differ.
    fn is_response(&self, req: &ApsDataRequest) -> bool {
        if req.asdu.len() < 3 {
            return false;
        }

        let seq = if req.asdu.len() >= 5 && req.asdu[0] & ZCL_FC_MANUFACTURER_SPECIFIC != 0 {
            req.asdu[3]
        } else {
            req.asdu[1]
        };

        seq == self.sequence_number
    }

    fn check_request(&mut self, req: &ApsDataRequest) {
        if self.state != ResponderState::Watch {
            return;
        }
        if !self.src_address.is_same(&req.dst_address) {
            return;
        }
        if req.profile_id != self.profile_id || req.cluster_id != self.cluster_id {
            return;
        }

        if self.need_default_response() {
            if self.is_response(req) {
                self.state = ResponderState::HasResponse;
            }
        } else {
            self.state = ResponderState::NoResponseNeeded;
        }
    }

    /// Builds the default response frame, direction and manufacturer bits
    /// inverted/mirrored from the request.
    fn build_response(&self, status: u8) -> ApsDataRequest {
        let mut frame_control = ZCL_FC_PROFILE_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE;

        if self.frame_control & ZCL_FC_DIRECTION_SERVER_TO_CLIENT == 0 {
            frame_control |= ZCL_FC_DIRECTION_SERVER_TO_CLIENT;
        }

        if self.manufacturer_code != 0 {
            frame_control |= ZCL_FC_MANUFACTURER_SPECIFIC;
        }

        let out = ZclFrame {
            frame_control,
            manufacturer_code: self.manufacturer_code,
            sequence_number: self.sequence_number,
            command_id: zcl_command::DEFAULT_RESPONSE,
            payload: vec![self.command_id, status],
        };

        ApsDataRequest {
            dst_addr_mode: self.dst_addr_mode,
            dst_address: self.src_address,
            dst_endpoint: self.src_endpoint,
            src_endpoint: self.dst_endpoint,
            profile_id: self.profile_id,
            cluster_id: self.cluster_id,
            asdu: out.serialize(),
            tx_options: 0,
            radius: 0,
        }
    }
}

/// Wraps the raw `ApsController` so every outgoing request passes the
/// default-response watchdog and the unconfirmed-request accounting.
pub struct ApsCtrlWrapper<C: ApsController> {
    ctrl: C,
    responder: Option<ZclDefaultResponder>,
    unconfirmed: Vec<UnconfirmedRequest>,
}

impl<C: ApsController> ApsCtrlWrapper<C> {
    #[must_use]
    pub fn new(ctrl: C) -> Self {
        Self { ctrl, responder: None, unconfirmed: Vec::new() }
    }

    #[must_use]
    pub fn inner(&self) -> &C {
        &self.ctrl
    }

    pub fn inner_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    /// Opens the default-response scope for an inbound ZCL indication.
    /// Must be paired with `end_indication`.
    pub fn begin_indication(&mut self, ind: &ApsDataIndication, frame: &ZclFrame) {
        debug_assert!(self.responder.is_none(), "indication scope is not reentrant");
        self.responder = Some(ZclDefaultResponder::new(ind, frame));
    }

    /// Closes the scope; emits the default response when no specific
    /// response was observed and the request required one.
    pub fn end_indication(&mut self) {
        let Some(responder) = self.responder.take() else {
            return;
        };

        if responder.state == ResponderState::Watch && responder.need_default_response() {
            let req = responder.build_response(zigbee_aps::zcl_status::SUCCESS);
            if let Err(err) = self.ctrl.aps_request(&req) {
                tracing::warn!("failed to send ZCL default response: {err}");
            }
        }
    }

    /// Marks a request as confirmed; the id comes from APS-DATA.confirm.
    pub fn confirm(&mut self, id: u8) {
        self.unconfirmed.retain(|u| u.id != id);
    }

    /// Drops requests whose confirm never arrived.
    pub fn prune_unconfirmed(&mut self, now: SteadyTime) {
        self.unconfirmed
            .retain(|u| now.elapsed_since(u.sent_at) < UNCONFIRMED_EXPIRY_MS);
    }
}

impl<C: ApsController> ApsSend for ApsCtrlWrapper<C> {
    fn send(&mut self, req: &ApsDataRequest) -> Result<u8, ApsError> {
        if let Some(responder) = self.responder.as_mut() {
            responder.check_request(req);
        }

        let id = self.ctrl.aps_request(req)?;
        self.unconfirmed.push(UnconfirmedRequest {
            id,
            dst_ext: req.dst_address.ext,
            sent_at: crate::clock::steady_now(),
        });
        Ok(id)
    }

    fn next_zcl_sequence(&mut self) -> u8 {
        self.ctrl.next_zcl_sequence()
    }

    fn unconfirmed_requests(&self) -> usize {
        self.unconfirmed.len()
    }

    fn unconfirmed_for_ext(&self, ext: u64) -> usize {
        self.unconfirmed.iter().filter(|u| u.dst_ext == ext).count()
    }

    fn node_for_ext(&self, ext: u64) -> Option<Node> {
        self.ctrl.node_for_ext(ext).cloned()
    }

    fn node_at(&self, index: usize) -> Option<Node> {
        self.ctrl.node(index).cloned()
    }
}
