use crate::registry::Interface;
use crate::route::{Family, Route};
use crate::Error;
use futures::TryStreamExt;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::RouteMessageBuilder;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const RT_TABLE_MAIN: u8 = 254;

pub(crate) async fn enumerate() -> Result<HashMap<String, Interface>, Error> {
    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| Error::Enumeration(e.into()))?;
    tokio::spawn(connection);

    let mut by_name: HashMap<String, Interface> = HashMap::new();
    let mut name_by_index: HashMap<u32, String> = HashMap::new();

    let mut links = handle.link().get().execute();
    while let Some(msg) = links
        .try_next()
        .await
        .map_err(|e| Error::Enumeration(e.into()))?
    {
        let index = msg.header.index;

        let mut name = None;
        let mut mtu = 0u32;
        let mut hardware_addr = Vec::new();

        for attr in msg.attributes {
            match attr {
                LinkAttribute::IfName(n) => name = Some(n),
                LinkAttribute::Mtu(m) => mtu = m,
                LinkAttribute::Address(a) => hardware_addr = a,
                _ => {}
            }
        }

        let Some(name) = name else { continue };

        name_by_index.insert(index, name.clone());
        by_name.insert(
            name.clone(),
            Interface::new(index, name, mtu, hardware_addr),
        );
    }

    let mut addrs = handle.address().get().execute();
    while let Some(msg) = addrs
        .try_next()
        .await
        .map_err(|e| Error::Enumeration(e.into()))?
    {
        let index = msg.header.index;
        let prefix_len = msg.header.prefix_len;

        let Some(name) = name_by_index.get(&index) else {
            continue;
        };
        let Some(iface) = by_name.get_mut(name) else {
            continue;
        };

        for attr in msg.attributes {
            let AddressAttribute::Address(addr) = attr else {
                continue;
            };

            let prefix = match addr {
                IpAddr::V4(v4) => Ipv4Net::new(v4, prefix_len).ok().map(IpNet::V4),
                IpAddr::V6(v6) => Ipv6Net::new(v6, prefix_len).ok().map(IpNet::V6),
            };

            if let Some(prefix) = prefix {
                iface.push_addr(prefix);
            }
        }
    }

    for iface in by_name.values_mut() {
        iface.finalize();
    }

    Ok(by_name)
}

pub(crate) async fn default_route(family: Family) -> Result<Route, Error> {
    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| Error::Enumeration(e.into()))?;
    tokio::spawn(connection);

    let request = match family {
        Family::V4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
        Family::V6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
    };

    let mut routes = handle.route().get(request).execute();
    let mut candidate_oif = None;

    while let Some(route) = routes
        .try_next()
        .await
        .map_err(|e| Error::Enumeration(e.into()))?
    {
        if route.header.table != RT_TABLE_MAIN {
            continue;
        }

        let mut dst_is_unspecified = false;
        let mut oif = None;

        for attr in &route.attributes {
            match attr {
                RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                    dst_is_unspecified = addr.is_unspecified();
                }
                RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
                    dst_is_unspecified = addr.is_unspecified();
                }
                RouteAttribute::Oif(index) => oif = Some(*index),
                _ => {}
            }
        }

        if !dst_is_unspecified {
            continue;
        }

        if let Some(index) = oif {
            candidate_oif = Some(index);
            break;
        }
    }

    let index = candidate_oif.ok_or(Error::NoRoute)?;

    let interfaces = enumerate().await?;
    let name = interfaces
        .values()
        .find(|iface| iface.index == index)
        .map(|iface| iface.name.clone())
        .ok_or(Error::NoRoute)?;

    Ok(Route {
        interface_name: name,
        interface_index: index,
    })
}
