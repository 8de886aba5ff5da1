//! Builds and tears down the `ip rule` ladder that steals selected traffic
//! into the TUN's private routing table without touching the main table.
//!
//! The IPv6 half is split into `::/1` and `8000::/1` goto rules rather than a
//! single `::/0` source match: some kernels reject a `::/0` source selector
//! outright. This quirk is intentional, not a bug, and must not be
//! "simplified" back to one rule.
//!
//! The suppress-prefixlen-0 rule ahead of the to-table catch-all exists so
//! the dport-53 exception right after it gets a chance to match before the
//! catch-all's own default route would otherwise swallow every destination,
//! DNS included.

use crate::options::Options;
use anyhow::{Context as _, Result};
use netlink_packet_route::route::RouteProtocol;
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RulePortRange};
use rtnetlink::{Error::NetlinkError, Handle, RuleAddRequest};
use std::net::{Ipv4Addr, Ipv6Addr};

/// The kernel's well-known main routing table id (`ip route show table main`).
const MAIN_TABLE: u32 = 254;

/// DNS: traffic to this destination port escapes the private table so it
/// keeps resolving against whatever the host's own routing would have used.
const DNS_PORT: u16 = 53;

/// Rules this module added, so [`uninstall`] can remove exactly what it put
/// down and nothing else.
#[derive(Debug, Default, Clone)]
pub struct InstalledRules {
    pub base_priority: u32,
    /// Dynamically-allocated negative priorities used by the two IPv6
    /// half-address-space goto rules.
    pub ipv6_goto_priorities: Vec<i32>,
}

pub async fn install(handle: &Handle, options: &Options) -> Result<InstalledRules> {
    let base = options.rule_index;
    // +2 over the old headroom: the suppress-prefixlen and DNS-exception
    // rules now also draw from this per-prefix priority budget.
    let nop_priority = base + 12;

    let mut installed = InstalledRules {
        base_priority: base,
        ipv6_goto_priorities: Vec::new(),
    };

    if !options.inet4_address.is_empty() {
        let mut priority = base;

        for network in &options.inet4_address {
            destination_rule_v4(handle, priority, network.network_address(), network.netmask(), options.table_index)
                .execute()
                .await
                .or_else(ignore_eexist)
                .context("Failed to add IPv4 destination-match rule")?;
            priority += 1;
        }

        suppress_prefixlen_rule_v4(handle, priority, options.table_index)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv4 suppress-prefixlen rule")?;
        priority += 1;

        dns_exception_rule_v4(handle, priority)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv4 DNS-exception rule")?;
        priority += 1;

        to_table_rule_v4(handle, priority, options.table_index)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv4 to-table rule")?;
        priority += 1;

        for network in &options.inet4_address {
            loopback_escape_rule_v4(handle, priority, network.network_address(), network.netmask(), options.table_index)
                .execute()
                .await
                .or_else(ignore_eexist)
                .context("Failed to add IPv4 loopback-escape rule")?;
            priority += 1;
        }

        terminal_rule_v4(handle, nop_priority)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv4 terminal rule")?;
    }

    if !options.inet6_address.is_empty() {
        let mut priority = base;

        for network in &options.inet6_address {
            destination_rule_v6(handle, priority, network.network_address(), network.netmask(), options.table_index)
                .execute()
                .await
                .or_else(ignore_eexist)
                .context("Failed to add IPv6 destination-match rule")?;
            priority += 1;
        }

        suppress_prefixlen_rule_v6(handle, priority, options.table_index)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv6 suppress-prefixlen rule")?;
        priority += 1;

        dns_exception_rule_v6(handle, priority)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv6 DNS-exception rule")?;
        priority += 1;

        to_table_rule_v6(handle, priority, options.table_index)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv6 to-table rule")?;
        priority += 1;

        for network in &options.inet6_address {
            loopback_escape_rule_v6(handle, priority, network.network_address(), network.netmask(), options.table_index)
                .execute()
                .await
                .or_else(ignore_eexist)
                .context("Failed to add IPv6 loopback-escape rule")?;
            priority += 1;
        }

        terminal_rule_v6(handle, nop_priority)
            .execute()
            .await
            .or_else(ignore_eexist)
            .context("Failed to add IPv6 terminal rule")?;

        for prefix in [("::", 1u8), ("8000::", 1u8)] {
            let priority = next_free_v6_priority(handle).await;

            goto_rule_v6(handle, priority, prefix.0.parse()?, prefix.1, nop_priority)
                .execute()
                .await
                .or_else(ignore_eexist)
                .context("Failed to add IPv6 half-space goto rule")?;

            installed.ipv6_goto_priorities.push(priority);
        }
    }

    Ok(installed)
}

pub async fn uninstall(handle: &Handle, installed: &InstalledRules) {
    for &priority in &installed.ipv6_goto_priorities {
        let _ = delete_by_priority_v6(handle, priority).await;
    }

    let start = installed.base_priority;
    let end = start + 12;

    delete_priority_range(handle, start, end).await;
}

fn base_rule(handle: &Handle, priority: u32, table: u32) -> RuleAddRequest {
    let mut rule = handle
        .rule()
        .add()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);

    rule.message_mut()
        .attributes
        .push(RuleAttribute::Protocol(RouteProtocol::Static));

    rule
}

fn to_table_rule_v4(handle: &Handle, priority: u32, table: u32) -> RuleAddRequest<Ipv4Addr> {
    base_rule(handle, priority, table).v4()
}

fn to_table_rule_v6(handle: &Handle, priority: u32, table: u32) -> RuleAddRequest<Ipv6Addr> {
    base_rule(handle, priority, table).v6()
}

fn terminal_rule_v4(handle: &Handle, priority: u32) -> RuleAddRequest<Ipv4Addr> {
    handle.rule().add().priority(priority).v4()
}

fn terminal_rule_v6(handle: &Handle, priority: u32) -> RuleAddRequest<Ipv6Addr> {
    handle.rule().add().priority(priority).v6()
}

/// Traffic addressed *to* one of the TUN's own assigned prefixes still needs
/// to resolve through the private table rather than falling through to the
/// suppress/DNS rules meant for traffic leaving the host entirely.
fn destination_rule_v4(handle: &Handle, priority: u32, dst: Ipv4Addr, dst_len: u8, table: u32) -> RuleAddRequest<Ipv4Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);

    let message = rule.message_mut();
    message.header.dst_len = dst_len;
    message.attributes.push(RuleAttribute::Destination(dst.into()));

    rule.v4()
}

fn destination_rule_v6(handle: &Handle, priority: u32, dst: Ipv6Addr, dst_len: u8, table: u32) -> RuleAddRequest<Ipv6Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);

    let message = rule.message_mut();
    message.header.dst_len = dst_len;
    message.attributes.push(RuleAttribute::Destination(dst.into()));

    rule.v6()
}

/// Packets that originated on loopback from one of the TUN's own assigned
/// prefixes (the host talking to itself through an address it only has
/// because of this device) still belong in the private table, same as any
/// other traffic carrying that source.
/// A default-route rule (`0.0.0.0/0` at prefix length 0) that suppresses
/// itself whenever the kernel's best match in the private table is *also* a
/// default route, falling through instead of looping traffic that has no
/// more specific route back into the same table. This is what gives the
/// DNS-exception rule right after it a chance to act before the catch-all
/// claims everything.
fn suppress_prefixlen_rule_v4(handle: &Handle, priority: u32, table: u32) -> RuleAddRequest<Ipv4Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);

    rule.message_mut()
        .attributes
        .push(RuleAttribute::SuppressPrefixLen(0));

    rule.v4()
}

fn suppress_prefixlen_rule_v6(handle: &Handle, priority: u32, table: u32) -> RuleAddRequest<Ipv6Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);

    rule.message_mut()
        .attributes
        .push(RuleAttribute::SuppressPrefixLen(0));

    rule.v6()
}

/// Traffic to destination port 53 (DNS) is routed through the main table
/// instead of the private one, so host name resolution keeps working against
/// whatever resolver the host's own routing would have reached.
fn dns_exception_rule_v4(handle: &Handle, priority: u32) -> RuleAddRequest<Ipv4Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(MAIN_TABLE)
        .priority(priority)
        .action(RuleAction::ToTable);

    rule.message_mut()
        .attributes
        .push(RuleAttribute::DestinationPortRange(RulePortRange {
            start: DNS_PORT,
            end: DNS_PORT,
        }));

    rule.v4()
}

fn dns_exception_rule_v6(handle: &Handle, priority: u32) -> RuleAddRequest<Ipv6Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(MAIN_TABLE)
        .priority(priority)
        .action(RuleAction::ToTable);

    rule.message_mut()
        .attributes
        .push(RuleAttribute::DestinationPortRange(RulePortRange {
            start: DNS_PORT,
            end: DNS_PORT,
        }));

    rule.v6()
}

fn loopback_escape_rule_v4(handle: &Handle, priority: u32, src: Ipv4Addr, src_len: u8, table: u32) -> RuleAddRequest<Ipv4Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);

    let message = rule.message_mut();
    message.header.src_len = src_len;
    message.attributes.push(RuleAttribute::Source(src.into()));
    message.attributes.push(RuleAttribute::Iifname("lo".to_owned()));

    rule.v4()
}

fn loopback_escape_rule_v6(handle: &Handle, priority: u32, src: Ipv6Addr, src_len: u8, table: u32) -> RuleAddRequest<Ipv6Addr> {
    let mut rule = handle
        .rule()
        .add()
        .table_id(table)
        .priority(priority)
        .action(RuleAction::ToTable);

    let message = rule.message_mut();
    message.header.src_len = src_len;
    message.attributes.push(RuleAttribute::Source(src.into()));
    message.attributes.push(RuleAttribute::Iifname("lo".to_owned()));

    rule.v6()
}

fn goto_rule_v6(
    handle: &Handle,
    priority: i32,
    src: Ipv6Addr,
    src_len: u8,
    goto: u32,
) -> RuleAddRequest<Ipv6Addr> {
    let mut rule = handle
        .rule()
        .add()
        .priority(priority as u32)
        .action(RuleAction::Goto);

    {
        let message = rule.message_mut();
        message.header.src_len = src_len;
        message
            .attributes
            .push(RuleAttribute::Source(src.into()));
        message.attributes.push(RuleAttribute::Goto(goto));
        message
            .attributes
            .push(RuleAttribute::Iifname("lo".to_owned()));
    }

    rule.v6()
}

async fn next_free_v6_priority(handle: &Handle) -> i32 {
    use futures::TryStreamExt;

    let mut rules = handle.rule().get(rtnetlink::IpVersion::V6).execute();
    let mut min_priority = 0i32;

    while let Ok(Some(rule)) = rules.try_next().await {
        let priority = rule
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Priority(p) => Some(*p as i32),
                _ => None,
            })
            .unwrap_or(0);

        if priority > 0 && (min_priority == 0 || priority < min_priority) {
            min_priority = priority;
        }
    }

    min_priority - 1
}

async fn delete_by_priority_v6(handle: &Handle, priority: i32) -> Result<(), rtnetlink::Error> {
    let mut rule = handle.rule().add().priority(priority as u32).v6();
    // Deletion only inspects family + priority; the rest of the message is irrelevant.
    handle.rule().del(rule.message_mut().clone()).execute().await
}

async fn delete_priority_range(handle: &Handle, start: u32, end: u32) {
    use futures::TryStreamExt;

    for version in [rtnetlink::IpVersion::V4, rtnetlink::IpVersion::V6] {
        let mut rules = handle.rule().get(version).execute();
        let mut to_delete = Vec::new();

        while let Ok(Some(rule)) = rules.try_next().await {
            let priority = rule.attributes.iter().find_map(|a| match a {
                RuleAttribute::Priority(p) => Some(*p),
                _ => None,
            });

            if let Some(priority) = priority {
                if priority >= start && priority <= end {
                    to_delete.push(rule);
                }
            }
        }

        for rule in to_delete {
            let _ = handle.rule().del(rule).execute().await;
        }
    }
}

fn ignore_eexist(err: rtnetlink::Error) -> Result<(), rtnetlink::Error> {
    match &err {
        NetlinkError(e) if e.raw_code() == -libc::EEXIST => Ok(()),
        _ => Err(err),
    }
}
