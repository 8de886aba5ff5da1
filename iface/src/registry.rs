use crate::Error;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

/// A snapshot of a single host network interface at the time of the last flush.
#[derive(Debug, Clone)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    /// Every address on the interface, v4 entries before v6, in discovery order.
    pub addrs: Vec<IpNet>,
    pub addrs_v4: Vec<IpNet>,
    pub addrs_v6: Vec<IpNet>,
    pub hardware_addr: Vec<u8>,
}

impl Interface {
    pub(crate) fn new(index: u32, name: String, mtu: u32, hardware_addr: Vec<u8>) -> Self {
        Self {
            index,
            name,
            mtu,
            addrs: Vec::new(),
            addrs_v4: Vec::new(),
            addrs_v6: Vec::new(),
            hardware_addr,
        }
    }

    pub(crate) fn push_addr(&mut self, prefix: IpNet) {
        match prefix {
            IpNet::V4(_) => self.addrs_v4.push(prefix),
            IpNet::V6(_) => self.addrs_v6.push(prefix),
        }
    }

    pub(crate) fn finalize(&mut self) {
        self.addrs.clear();
        self.addrs.extend(self.addrs_v4.iter().copied());
        self.addrs.extend(self.addrs_v6.iter().copied());
    }
}

/// Process-wide, read-mostly cache of host interfaces.
///
/// Readers take the shared lock and clone out what they need; [`Registry::flush`]
/// takes the exclusive lock and atomically replaces the whole snapshot.
#[derive(Default)]
pub struct Registry {
    record: RwLock<HashMap<String, Interface>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_index(&self, index: u32) -> Result<Interface, Error> {
        let record = self.record.read().expect("registry lock poisoned");
        record
            .values()
            .find(|iface| iface.index == index)
            .cloned()
            .ok_or(Error::IndexNotFound(index))
    }

    pub fn by_name(&self, name: &str) -> Result<Interface, Error> {
        let record = self.record.read().expect("registry lock poisoned");
        record
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NameNotFound(name.to_owned()))
    }

    pub fn all_names(&self) -> Vec<String> {
        let record = self.record.read().expect("registry lock poisoned");
        record.keys().cloned().collect()
    }

    /// Returns a defensive copy of every known interface; mutating the result
    /// never affects the registry.
    pub fn all(&self) -> Vec<Interface> {
        let record = self.record.read().expect("registry lock poisoned");
        record.values().cloned().collect()
    }

    /// Atomically replaces the snapshot with a freshly enumerated one.
    pub(crate) fn replace(&self, fresh: HashMap<String, Interface>) {
        let mut record = self.record.write().expect("registry lock poisoned");
        *record = fresh;
    }
}

/// Picks the best local address on `iface` to reach `dst`, falling back to the
/// first non-link-local candidate seen if nothing contains `dst`.
pub fn pick_addr(iface: &Interface, dst: Option<IpAddr>, v6: bool) -> Option<IpAddr> {
    let candidates = if v6 { &iface.addrs_v6 } else { &iface.addrs_v4 };

    let mut fallback = None;

    for prefix in candidates {
        let addr = prefix.addr();

        if fallback.is_none() && !is_link_local_unicast(addr) {
            fallback = Some(addr);
        }

        if let Some(dst) = dst {
            if prefix.contains(&dst) {
                return Some(addr);
            }
        }
    }

    fallback.or_else(|| candidates.first().map(|p| p.addr()))
}

fn is_link_local_unicast(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Convenience wrapper matching the spec's `PickIPv4Addr`.
pub fn pick_ipv4_addr(iface: &Interface, dst: Option<IpAddr>) -> Option<IpAddr> {
    pick_addr(iface, dst, false)
}

/// Convenience wrapper matching the spec's `PickIPv6Addr`.
pub fn pick_ipv6_addr(iface: &Interface, dst: Option<IpAddr>) -> Option<IpAddr> {
    pick_addr(iface, dst, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface_with(addrs: &[&str]) -> Interface {
        let mut iface = Interface::new(1, "eth0".into(), 1500, vec![]);
        for a in addrs {
            iface.push_addr(a.parse().unwrap());
        }
        iface.finalize();
        iface
    }

    #[test]
    fn picks_same_subnet_address() {
        let iface = iface_with(&["10.0.0.5/24", "192.168.1.5/24"]);

        let picked = pick_ipv4_addr(&iface, Some("10.0.0.99".parse().unwrap()));

        assert_eq!(picked, Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn falls_back_past_link_local() {
        let iface = iface_with(&["169.254.1.1/16", "192.168.2.2/24"]);

        let picked = pick_ipv4_addr(&iface, Some("8.8.8.8".parse().unwrap()));

        assert_eq!(picked, Some("192.168.2.2".parse().unwrap()));
    }
}
