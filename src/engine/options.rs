//! Tunnel configuration (§4.E, §9 open questions).

use crate::wire::ClassOfService;

/// Tunable knobs for one tunnel. `max_request_retries` defaults to 1: a single
/// retransmit attempt before a still-unacked packet is treated as a fatal
/// transport error and the tunnel closes (§9 open question, resolved).
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub stream_id: i32,
    pub domain_type: u8,
    pub class_of_service: ClassOfService,
    pub max_request_retries: u32,
    pub recv_window_size: i32,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        TunnelOptions {
            stream_id: 0,
            domain_type: 0,
            class_of_service: ClassOfService::default(),
            max_request_retries: 1,
            recv_window_size: 64 * 1024,
        }
    }
}
