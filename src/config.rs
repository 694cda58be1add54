use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTROLLER_PORT: u16 = 6699;
pub const DEFAULT_TCP_LISTENING_PORT: u16 = 6868;
pub const DEFAULT_UDP_LISTENING_PORT: u16 = 6868;
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 35_000;

/// Immutable configuration passed explicitly to the aggregator at
/// construction. No module reads configuration from a global; every
/// component that needs a value is handed its own `Arc<Config>` or a
/// copy of the relevant field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    pub transport: TransportChoice,

    #[serde(default)]
    pub pseudo_sessions: Vec<PseudoSessionConfig>,

    #[serde(default = "default_controller_port")]
    pub controller_port: u16,

    #[serde(default = "default_tcp_listening_port")]
    pub tcp_listening_port: u16,

    #[serde(default = "default_udp_listening_port")]
    pub udp_listening_port: u16,

    /// Disables the listening socket entirely (sender-only node), used by
    /// tests that exercise one half of a peer pair in-process.
    #[serde(default)]
    pub local_debug_no_receiving_socket: bool,
}

fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}
fn default_controller_port() -> u16 {
    DEFAULT_CONTROLLER_PORT
}
fn default_tcp_listening_port() -> u16 {
    DEFAULT_TCP_LISTENING_PORT
}
fn default_udp_listening_port() -> u16 {
    DEFAULT_UDP_LISTENING_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportChoice {
    Tcp,
    Udp(UdpCoderConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpCoderConfig {
    pub coder_name: String,
    #[serde(default)]
    pub coder_delay_constraint: Option<f64>,
    #[serde(default)]
    pub coder_loss_rate: Option<f64>,
    #[serde(default)]
    pub coder_loss_burst: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudoSessionConfig {
    pub session_id: String,
    pub session_type: PseudoSessionType,
    pub src: u32,
    pub dst: u32,
    pub rate: f64,
    pub burst_size: usize,
    pub ori_data_path: Option<String>,
    pub message_size: Option<u64>,
    pub payload_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PseudoSessionType {
    Source,
    Sink,
}

impl Config {
    pub fn is_udp(&self) -> bool {
        matches!(self.transport, TransportChoice::Udp(_))
    }
}
