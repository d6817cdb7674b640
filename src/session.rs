//! Per-connection session handling (§4.4). One `run_session` future per
//! accepted websocket: a single-threaded read loop that decodes frames and
//! dispatches to the handler for each tag. Because only this task ever
//! touches `SessionState`'s own fields, they're plain (not `Arc`/atomic) —
//! the only thing shared across tasks is the `DeviceHandle` a session
//! installs into its domain's routing tables.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::crypto;
use crate::device::DeviceHandle;
use crate::domain::registry::DomainRegistry;
use crate::domain::state::Domain;
use crate::error::{RelayError, RelayResult};
use crate::frame::{
    tag_of, AuthFrame, DhcpFrame, DiscoveryFrame, ForwardFrame, FrameTag, GeneralFrame, PeerFrame, VMacFrame,
};
use crate::location::LocationAdapter;
use crate::net::transport::Websocket;
use crate::persistence::PersistenceAdapter;

const MIN_CLIENT_VERSION: &str = "5.4.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedContext {
    pub registry: Arc<DomainRegistry>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub location: Arc<dyn LocationAdapter>,
}

pub struct SessionState {
    id: SessionId,
    domain: Arc<Domain>,
    transport: Arc<Websocket>,
    handle: Option<Arc<DeviceHandle>>,
    banned: bool,
}

impl SessionState {
    pub fn new(domain: Arc<Domain>, transport: Arc<Websocket>) -> Self {
        Self { id: SessionId::new(), domain, transport, handle: None, banned: false }
    }
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn broadcast_address(domain: &Domain) -> u32 {
    domain.net_id() | domain.not_mask()
}

/// Dispatches one inbound frame (§4.4). Returns `Ok(())` to keep the
/// connection open, `Err` to tear it down — the caller logs and closes.
pub async fn handle_frame(state: &mut SessionState, ctx: &SharedContext, raw: &[u8]) -> RelayResult<()> {
    if state.banned {
        // Banned sessions silently discard every typed frame (§4.4); only
        // the transport-level ping/pong keeps the connection alive.
        return Ok(());
    }
    let tag = match tag_of(raw) {
        Some(tag) => tag,
        None => return Ok(()), // unknown tag: ignored, not an error (§4.1)
    };
    match tag {
        FrameTag::VMac => handle_vmac(state, ctx, raw).await,
        FrameTag::Auth => handle_auth(state, ctx, raw).await,
        FrameTag::Dhcp => handle_dhcp(state, ctx, raw).await,
        FrameTag::Forward => handle_forward(state, raw).await,
        FrameTag::Peer => handle_peer(state, ctx, raw).await,
        FrameTag::Discovery => handle_discovery(state, raw).await,
        FrameTag::General => handle_general(state, raw).await,
    }
}

async fn handle_vmac(state: &mut SessionState, _ctx: &SharedContext, raw: &[u8]) -> RelayResult<()> {
    let frame = VMacFrame::decode(raw)?;
    let vmac = frame.vmac_str()?.to_string();
    crypto::check_vmac(&state.domain.password, &vmac, frame.timestamp, &frame.hash, now_secs())?;

    let handle = Arc::new(DeviceHandle::new(state.id, state.domain.name.clone(), vmac.clone(), state.transport.clone()));

    {
        let mut tables = state.domain.write().await;
        tables.ws_device_map.insert(state.id, handle.clone());
    }
    state.handle = Some(handle);
    Ok(())
}

async fn handle_auth(state: &mut SessionState, ctx: &SharedContext, raw: &[u8]) -> RelayResult<()> {
    let frame = AuthFrame::decode(raw)?;
    crypto::check_auth(&state.domain.password, frame.ip, frame.timestamp, &frame.hash, now_secs())?;

    let handle = state
        .handle
        .clone()
        .ok_or_else(|| RelayError::protocol("auth received before vmac"))?;

    if frame.ip & state.domain.mask() != state.domain.net_id() {
        return Err(RelayError::protocol("auth ip outside domain subnet"));
    }

    // Evict any other connection sharing this vmac or already holding the
    // requested address (I1/I2, §9 open question: a concurrent AUTH for the
    // same address races here — the last writer to `ip_ws_map` wins rather
    // than either being rejected). Their RX/TX counters carry over into the
    // new device before the old transport is closed.
    let evicted = {
        let mut tables = state.domain.write().await;
        let mut evictees = Vec::new();
        if let Some(by_vmac) = tables
            .ws_device_map
            .iter()
            .find(|(id, h)| **id != state.id && h.vmac == handle.vmac)
            .map(|(_, h)| h.clone())
        {
            evictees.push(by_vmac);
        }
        if let Some(by_ip) = tables.ip_ws_map.get(&frame.ip).filter(|h| h.session_id != state.id).cloned() {
            if !evictees.iter().any(|h| h.session_id == by_ip.session_id) {
                evictees.push(by_ip);
            }
        }
        for evictee in &evictees {
            handle.add_rx(evictee.rx());
            handle.add_tx(evictee.tx());
            tables.ws_device_map.remove(&evictee.session_id);
            let evictee_ip = evictee.ip();
            if evictee_ip != 0 && tables.ip_ws_map.get(&evictee_ip).map(|h| h.session_id) == Some(evictee.session_id) {
                tables.ip_ws_map.remove(&evictee_ip);
            }
            evictee.set_online(false);
        }
        handle.set_ip(frame.ip);
        tables.ip_ws_map.insert(frame.ip, handle.clone());
        evictees
    };
    for evictee in evicted {
        evictee.transport.close().await;
        if let Err(e) = ctx.persistence.save_device(&evictee.snapshot()).await {
            warn!("auth eviction: failed to persist evicted device {}/{}: {e}", evictee.domain, evictee.vmac);
        }
    }

    // storage.Find(device): restore this (domain, vmac)'s own last
    // persisted counters/location/version, taking precedence over any
    // same-vmac evictee's in-memory carry-over above.
    if let Some(persisted) = ctx.persistence.find_device(&state.domain.name, &handle.vmac).await? {
        handle.restore_persisted_counters(&persisted);
    }
    handle.set_online(true);

    ctx.persistence.save_device(&handle.snapshot()).await?;

    info!(
        "domain {} auth ok vmac={} ip={}",
        state.domain.name,
        handle.vmac,
        Ipv4Addr::from(frame.ip)
    );

    // AUTH never replies (§4.4, candy/websocket.go handleAuthMessage): the
    // client isn't expecting a frame back, unlike DHCP's echoed suggestion.
    Ok(())
}

async fn handle_dhcp(state: &mut SessionState, ctx: &SharedContext, raw: &[u8]) -> RelayResult<()> {
    let frame = DhcpFrame::decode(raw)?;
    crypto::check_dhcp(&state.domain.password, frame.timestamp, &frame.hash, now_secs())?;

    if !state.domain.dhcp_enabled() {
        return Err(RelayError::protocol("dhcp requested on a domain without a dhcp cidr"));
    }
    let handle = state
        .handle
        .clone()
        .ok_or_else(|| RelayError::protocol("dhcp requested before vmac"))?;

    let ip = resolve_dhcp_ip(&state.domain, ctx.persistence.as_ref(), &handle.vmac, frame.cidr_str()).await?;

    let cidr = format!("{}/{}", Ipv4Addr::from(ip), state.domain.prefix_len());
    // Open question: the reply reuses the request's hash verbatim rather
    // than re-signing with the server's own timestamp (§9); clients only
    // check the cidr field.
    let reply = DhcpFrame { timestamp: frame.timestamp, cidr: DhcpFrame::cidr_field(&cidr), hash: frame.hash };
    state.transport.write_binary(reply.encode()).await
}

/// Reuse-vs-allocate decision for a device's DHCP address (§4.4): the
/// client's proposed CIDR is reused verbatim when it is well-formed, its
/// network part matches the domain's `netID`/`mask`, and persistence
/// shows either nobody or only this session's own vmac already owns that
/// address. Anything else falls through to a fresh sweep.
async fn resolve_dhcp_ip(
    domain: &Domain,
    persistence: &dyn PersistenceAdapter,
    vmac: &str,
    proposed_cidr: &str,
) -> RelayResult<u32> {
    if let Some(candidate) = parse_proposed_cidr(domain, proposed_cidr) {
        let ip_text = Ipv4Addr::from(candidate).to_string();
        let owners = persistence.devices_by_ip(&domain.name, &ip_text).await?;
        let reusable = owners.is_empty() || (owners.len() == 1 && owners[0].vmac == vmac);
        if reusable {
            return Ok(candidate);
        }
    }
    domain.allocate_host(persistence).await
}

/// Parses `"a.b.c.d/n"` and returns the address as a `u32` only if its
/// network part and prefix length match the domain's configured subnet.
fn parse_proposed_cidr(domain: &Domain, cidr: &str) -> Option<u32> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 32 {
        return None;
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let addr = u32::from(addr);
    if mask != domain.mask() || addr & mask != domain.net_id() {
        return None;
    }
    Some(addr)
}

/// Directed subnet broadcast or IPv4 multicast (224/4, top 4 bits `1110`).
fn is_broadcast_or_multicast_dst(domain: &Domain, dst: u32) -> bool {
    dst == broadcast_address(domain) || (dst >> 28) == 0b1110
}

/// FORWARD requires a device entry (else a protocol error: nothing has ever
/// identified this connection) but only *silently* drops the frame — no
/// error, no relay — when that device isn't ONLINE yet. Once online, `src`
/// must match the assigned address or the frame is rejected outright.
async fn handle_forward(state: &mut SessionState, raw: &[u8]) -> RelayResult<()> {
    let handle = state.handle.clone().ok_or_else(|| RelayError::protocol("unexpected forward message"))?;
    if !handle.is_online() {
        return Ok(());
    }
    let frame = ForwardFrame::decode(raw)?;
    if handle.ip() != frame.src {
        return Err(RelayError::protocol("forward message that does not match login information"));
    }
    let framelen = raw.len() as u64;
    let tables = state.domain.read().await;

    if state.domain.broadcast && is_broadcast_or_multicast_dst(&state.domain, frame.dst) {
        for (id, target) in tables.ws_device_map.iter() {
            if *id == state.id || !target.is_online() {
                continue;
            }
            target.add_rx(framelen);
            let _ = target.transport.write_binary(raw.to_vec()).await;
        }
    } else if let Some(target) = tables.ip_ws_map.get(&frame.dst) {
        target.add_rx(framelen);
        target.transport.write_binary(raw.to_vec()).await?;
    }
    handle.add_tx(framelen);
    Ok(())
}

/// PEER only requires IDENTIFIED (a device entry, from VMAC) — not
/// ONLINE — but still requires `src == device.ip`, which in practice can
/// only hold once AUTH has run (§4.4 design note: preserved deliberately).
async fn handle_peer(state: &mut SessionState, ctx: &SharedContext, raw: &[u8]) -> RelayResult<()> {
    let handle = state.handle.clone().ok_or_else(|| RelayError::protocol("peer conn unauthorized client"))?;
    let frame = PeerFrame::decode(raw)?;
    if handle.ip() != frame.src {
        return Err(RelayError::protocol("peer conn packet does not match the login user ip"));
    }

    let ip_text = Ipv4Addr::from(frame.ip_hint).to_string();
    if let Ok((country, region)) = ctx.location.lookup(&ip_text).await {
        handle.set_location(country, region);
    }
    let _ = ctx.persistence.save_device(&handle.snapshot()).await;

    let tables = state.domain.read().await;
    if let Some(target) = tables.ip_ws_map.get(&frame.dst) {
        target.transport.write_binary(raw.to_vec()).await?;
    }
    Ok(())
}

/// DISCOVERY treats "no device entry" and "not yet ONLINE" identically: both
/// are a silent no-op, not an error (unlike FORWARD, which errors on a
/// missing device). Broadcast to `0xFFFFFFFF` is unconditional on
/// `domain.broadcast` — discovery always fans out, unlike FORWARD/GENERAL.
async fn handle_discovery(state: &mut SessionState, raw: &[u8]) -> RelayResult<()> {
    let handle = match &state.handle {
        Some(h) if h.is_online() => h.clone(),
        _ => return Ok(()),
    };
    let frame = DiscoveryFrame::decode(raw)?;
    if handle.ip() != frame.src {
        return Err(RelayError::protocol("discovery message that does not match login information"));
    }
    let framelen = raw.len() as u64;
    let tables = state.domain.read().await;

    if let Some(target) = tables.ip_ws_map.get(&frame.dst) {
        target.add_rx(framelen);
        target.transport.write_binary(raw.to_vec()).await?;
    }
    if frame.dst == 0xFFFFFFFF {
        for (id, target) in tables.ws_device_map.iter() {
            if *id == state.id || !target.is_online() {
                continue;
            }
            target.add_rx(framelen);
            let _ = target.transport.write_binary(raw.to_vec()).await;
        }
    }
    handle.add_tx(framelen);
    Ok(())
}

/// GENERAL mirrors DISCOVERY's "missing or offline device ⇒ silent no-op"
/// shape, but its broadcast to `0xFFFFFFFF` is gated on `domain.broadcast`
/// like FORWARD.
async fn handle_general(state: &mut SessionState, raw: &[u8]) -> RelayResult<()> {
    let handle = match &state.handle {
        Some(h) if h.is_online() => h.clone(),
        _ => return Ok(()),
    };
    let frame = GeneralFrame::decode(raw)?;
    if handle.ip() != frame.src {
        return Err(RelayError::protocol("general message that does not match login information"));
    }
    let framelen = raw.len() as u64;

    let tables = state.domain.read().await;
    if let Some(target) = tables.ip_ws_map.get(&frame.dst) {
        target.add_rx(framelen);
        target.transport.write_binary(raw.to_vec()).await?;
    }
    if frame.dst == 0xFFFFFFFF && state.domain.broadcast {
        for (id, target) in tables.ws_device_map.iter() {
            if *id == state.id || !target.is_online() {
                continue;
            }
            target.add_rx(framelen);
            let _ = target.transport.write_binary(raw.to_vec()).await;
        }
    }
    handle.add_tx(framelen);
    Ok(())
}

/// Splits a `"candy::<os>::<version>"` ping payload into `(os, version)`.
/// Malformed input (missing `candy` tag, too few `::`-separated fields, or
/// an unparseable version) yields `None` rather than a best-effort guess —
/// it's treated the same as a too-low version (§4.4).
fn parse_ping_payload(payload: &[u8]) -> Option<(String, String)> {
    let payload = String::from_utf8_lossy(payload);
    let mut parts = payload.splitn(3, "::");
    if parts.next()? != "candy" {
        return None;
    }
    let os = parts.next()?.to_string();
    let version = parts.next()?.to_string();
    Some((os, version))
}

fn is_version_too_old(version: &str) -> bool {
    semver::Version::parse(version)
        .map(|v| v < semver::Version::parse(MIN_CLIENT_VERSION).unwrap())
        .unwrap_or(true)
}

/// Handles a transport-level WebSocket ping (§4.4, §6) — not one of the
/// seven typed frames. The payload is the text `"candy::<os>::<version>"`;
/// a malformed payload or a version below [`MIN_CLIENT_VERSION`] bans the
/// session (`state.banned = true`) rather than closing it: the ping/pong
/// handshake must keep completing or the transport itself would time out.
/// Once banned the state is permanent for the life of the connection. The
/// pong always echoes the original payload verbatim, banned or not.
pub async fn handle_ping(state: &mut SessionState, payload: &[u8]) -> RelayResult<()> {
    match parse_ping_payload(payload) {
        Some((os, version)) if !is_version_too_old(&version) => {
            if let Some(handle) = &state.handle {
                handle.update_os_version(os, version);
            }
        }
        Some((os, version)) => {
            warn!("domain {} banning client os={os} version={version} (below {MIN_CLIENT_VERSION})", state.domain.name);
            state.banned = true;
        }
        None => {
            warn!("domain {} banning client: malformed ping payload", state.domain.name);
            state.banned = true;
        }
    }
    state.transport.write_pong(payload.to_vec()).await
}

/// Cleanup run when a session's read loop exits, whether from a closed
/// socket, a protocol error, or a version ban (§4.4 cleanup algorithm).
/// Takes the domain's write lock: membership changes always do.
pub async fn cleanup_session(state: &SessionState, ctx: &SharedContext) {
    let mut tables = state.domain.write().await;
    tables.ws_device_map.remove(&state.id);
    if let Some(handle) = &state.handle {
        let ip = handle.ip();
        if ip != 0 {
            // Only remove the ip_ws_map entry if it still identifies this
            // session: an AUTH eviction may already have replaced it.
            if tables.ip_ws_map.get(&ip).map(|h| h.session_id) == Some(state.id) {
                tables.ip_ws_map.remove(&ip);
            }
        }
        // Only flip and persist if this session actually reached ONLINE
        // (completed AUTH) — a session that only ever sent VMAC leaves no
        // trace on disconnect, matching the original.
        if handle.is_online() {
            handle.set_online(false);
            drop(tables);
            let _ = ctx.persistence.save_device(&handle.snapshot()).await;
        }
    }
    debug!("session {:?} cleaned up on domain {}", state.id, state.domain.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::domain::state::DomainRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakePersistence {
        devices: StdMutex<HashMap<(String, String), Device>>,
    }

    impl FakePersistence {
        fn empty() -> Self {
            Self { devices: StdMutex::new(HashMap::new()) }
        }

        fn with_device(device: Device) -> Self {
            let mut map = HashMap::new();
            map.insert((device.domain.clone(), device.vmac.clone()), device);
            Self { devices: StdMutex::new(map) }
        }
    }

    #[async_trait]
    impl PersistenceAdapter for FakePersistence {
        async fn auto_migrate(&self) -> RelayResult<()> {
            Ok(())
        }
        async fn find_domain(&self, _: &str) -> RelayResult<Option<DomainRecord>> {
            Ok(None)
        }
        async fn delete_domain(&self, _: &str) -> RelayResult<()> {
            Ok(())
        }
        async fn find_device(&self, domain: &str, vmac: &str) -> RelayResult<Option<Device>> {
            Ok(self.devices.lock().unwrap().get(&(domain.to_string(), vmac.to_string())).cloned())
        }
        async fn save_device(&self, _: &Device) -> RelayResult<()> {
            Ok(())
        }
        async fn devices_by_ip(&self, domain: &str, ip_text: &str) -> RelayResult<Vec<Device>> {
            Ok(self
                .devices
                .lock()
                .unwrap()
                .values()
                .filter(|d| d.domain == domain && d.ip_text == ip_text)
                .cloned()
                .collect())
        }
        async fn device_owns_ip(&self, domain: &str, ip_text: &str) -> RelayResult<bool> {
            Ok(self.devices.lock().unwrap().values().any(|d| d.domain == domain && d.ip_text == ip_text))
        }
        async fn reset_all_online_false(&self) -> RelayResult<()> {
            Ok(())
        }
        async fn config_value(&self, _: &str) -> RelayResult<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn ping_payload_splits_tag_os_version() {
        let (os, version) = parse_ping_payload(b"candy::linux::5.4.1").unwrap();
        assert_eq!(os, "linux");
        assert_eq!(version, "5.4.1");
    }

    #[test]
    fn ping_payload_rejects_missing_fields_and_tag() {
        assert!(parse_ping_payload(b"candy").is_none());
        assert!(parse_ping_payload(b"candy::linux").is_none());
        assert!(parse_ping_payload(b"other::linux::5.4.1").is_none());
    }

    #[test]
    fn version_gate_accepts_minimum_and_above() {
        assert!(!is_version_too_old("5.4.0"));
        assert!(!is_version_too_old("5.4.1"));
        assert!(!is_version_too_old("6.0.0"));
    }

    #[test]
    fn version_gate_rejects_below_minimum_and_unparseable() {
        assert!(is_version_too_old("5.3.9"));
        assert!(is_version_too_old("not-a-version"));
    }

    #[test]
    fn broadcast_address_is_net_id_or_not_mask() {
        let record = DomainRecord {
            name: "d".into(),
            password: b"pw".to_vec(),
            dhcp: "10.0.0.0/24".into(),
            broadcast: true,
        };
        let domain = Domain::from_record(record).unwrap();
        assert_eq!(broadcast_address(&domain), 0x0a0000ffu32);
    }

    fn dhcp_domain() -> Domain {
        Domain::from_record(DomainRecord {
            name: "d".into(),
            password: b"pw".to_vec(),
            dhcp: "10.0.0.0/24".into(),
            broadcast: false,
        })
        .unwrap()
    }

    #[test]
    fn rejects_cidr_outside_domain_subnet() {
        let domain = dhcp_domain();
        assert!(parse_proposed_cidr(&domain, "10.0.1.5/24").is_none());
        assert!(parse_proposed_cidr(&domain, "10.0.0.5/16").is_none());
        assert!(parse_proposed_cidr(&domain, "not-a-cidr").is_none());
    }

    #[test]
    fn accepts_cidr_matching_domain_subnet() {
        let domain = dhcp_domain();
        assert_eq!(parse_proposed_cidr(&domain, "10.0.0.5/24"), Some(0x0a000005));
    }

    #[tokio::test]
    async fn dhcp_reuses_unclaimed_proposed_address() {
        let domain = dhcp_domain();
        let persistence = FakePersistence::empty();
        let ip = resolve_dhcp_ip(&domain, &persistence, "aaaaaaaaaaaaaaaa", "10.0.0.5/24").await.unwrap();
        assert_eq!(ip, 0x0a000005);
    }

    #[tokio::test]
    async fn dhcp_reuses_address_already_owned_by_same_vmac() {
        let domain = dhcp_domain();
        let mut device = Device::new("d", "aaaaaaaaaaaaaaaa");
        device.set_ip(0x0a000005);
        let persistence = FakePersistence::with_device(device);
        let ip = resolve_dhcp_ip(&domain, &persistence, "aaaaaaaaaaaaaaaa", "10.0.0.5/24").await.unwrap();
        assert_eq!(ip, 0x0a000005);
    }

    #[tokio::test]
    async fn dhcp_falls_back_to_allocation_when_address_owned_by_other_vmac() {
        let domain = dhcp_domain();
        let mut device = Device::new("d", "bbbbbbbbbbbbbbbb");
        device.set_ip(0x0a000005);
        let persistence = FakePersistence::with_device(device);
        let ip = resolve_dhcp_ip(&domain, &persistence, "aaaaaaaaaaaaaaaa", "10.0.0.5/24").await.unwrap();
        assert_ne!(ip, 0x0a000005);
        assert_eq!(ip & 0xffffff00, 0x0a000000);
    }

    #[tokio::test]
    async fn dhcp_falls_back_to_allocation_on_malformed_or_foreign_cidr() {
        let domain = dhcp_domain();
        let persistence = FakePersistence::empty();
        let ip = resolve_dhcp_ip(&domain, &persistence, "aaaaaaaaaaaaaaaa", "192.168.0.5/24").await.unwrap();
        assert_eq!(ip & 0xffffff00, 0x0a000000);
    }
}
