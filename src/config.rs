use std::net::{Ipv4Addr, SocketAddr};

pub const DEFAULT_PORT: u16 = 801;
const DEFAULT_BACKLOG: i32 = 1024;

/// Where and how the listener binds. There is no runtime configuration
/// source; `main` always uses [`ListenConfig::default`].
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub addr: SocketAddr,
    pub backlog: i32,
    /// Number of tokio worker threads.
    pub workers: usize,
}

impl ListenConfig {
    /// Same as the default config but bound to `addr`.
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Default::default()
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            backlog: DEFAULT_BACKLOG,
            workers: num_cpus::get_physical().max(1),
        }
    }
}
