use ip_network::{Ipv4Network, Ipv6Network};

pub const DEFAULT_IP_ROUTE2_TABLE_INDEX: u32 = 4000;
pub const DEFAULT_IP_ROUTE2_RULE_INDEX: u32 = 10086;
pub const DEFAULT_MTU: u32 = 9000;

/// Configuration for a single TUN device.
///
/// `table_index == 0` is a sentinel meaning "allocate a fresh, collision-free
/// table id at provisioning time" rather than "use table 0" (the kernel's
/// unspecified-table value is never a usable table anyway).
#[derive(Debug, Clone)]
pub struct Options {
    pub name: String,
    pub inet4_address: Vec<Ipv4Network>,
    pub inet6_address: Vec<Ipv6Network>,
    pub mtu: u32,
    pub table_index: u32,
    pub rule_index: u32,
    pub auto_route: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: String::new(),
            inet4_address: Vec::new(),
            inet6_address: Vec::new(),
            mtu: DEFAULT_MTU,
            table_index: DEFAULT_IP_ROUTE2_TABLE_INDEX,
            rule_index: DEFAULT_IP_ROUTE2_RULE_INDEX,
            auto_route: false,
        }
    }
}

impl Options {
    /// Applies the same defaulting `NewTunDevice` does: a generated name when
    /// none is given, MTU 9000, and the stock rule index.
    ///
    /// `table_index` is deliberately left alone here: `0` is the sentinel
    /// that tells `configure()` to allocate a fresh, collision-free table id
    /// at provisioning time, and defaulting it to a fixed value this early
    /// would make that allocation path unreachable.
    pub fn with_defaults(mut self) -> Self {
        if self.name.is_empty() {
            self.name = calculate_interface_name(None);
        }
        if self.mtu == 0 {
            self.mtu = DEFAULT_MTU;
        }
        if self.rule_index == 0 {
            self.rule_index = DEFAULT_IP_ROUTE2_RULE_INDEX;
        }
        self
    }
}

/// Picks a free `tunN`-style name by scanning the host's existing interfaces.
pub fn calculate_interface_name(preferred: Option<&str>) -> String {
    let base = preferred.filter(|s| !s.is_empty()).unwrap_or("tun");

    let mut next_index = 0u32;

    for iface in iface::global().all() {
        if let Some(suffix) = iface.name.strip_prefix(base) {
            if let Ok(index) = suffix.parse::<u32>() {
                next_index = next_index.max(index + 1);
            }
        }
    }

    format!("{base}{next_index}")
}
