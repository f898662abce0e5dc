//! STUN NAT type discovery
//!
//! Classic RFC 3489 test sequence against a single STUN server:
//!
//! 1. Binding request; no answer means UDP is blocked.
//! 2. Same request with CHANGE-REQUEST(ip, port).
//! 3. Binding request to the server's CHANGED-ADDRESS.
//! 4. CHANGE-REQUEST(port) to the changed IP.

use serde::{Serialize, Serializer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::config::StunConfig;
use crate::error::{AppError, Result};
use crate::error_throttled;
use crate::utils::{bind_udp_socket, LogThrottler};

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_SOURCE_ADDRESS: u16 = 0x0004;
const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const CHANGE_IP_AND_PORT: u32 = 0x06;
const CHANGE_PORT: u32 = 0x02;

/// Detected NAT behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StunNatType {
    /// Probe failed before a verdict
    #[default]
    Error,
    Blocked,
    OpenInternet,
    SymmetricUdpFirewall,
    FullConeNat,
    RestrictedNat,
    RestrictedPortNat,
    SymmetricNat,
    ChangedAddrError,
}

impl StunNatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StunNatType::Error => "",
            StunNatType::Blocked => "Blocked",
            StunNatType::OpenInternet => "Open Internet",
            StunNatType::SymmetricUdpFirewall => "Symmetric UDP Firewall",
            StunNatType::FullConeNat => "Full Cone NAT",
            StunNatType::RestrictedNat => "Restricted NAT",
            StunNatType::RestrictedPortNat => "Restricted Port NAT",
            StunNatType::SymmetricNat => "Symmetric NAT",
            StunNatType::ChangedAddrError => "Error when testing on Changed-IP and Port",
        }
    }
}

impl std::fmt::Display for StunNatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for StunNatType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Result of a probe; also the runner's view of the network
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StunInfo {
    pub nat_type: StunNatType,
    pub src_ip: String,
    /// External address, empty when unknown
    pub ext_ip: String,
    pub stun_host: String,
    pub stun_ip: String,
    pub stun_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StunResponse {
    ok: bool,
    ext: Option<SocketAddr>,
    src: Option<SocketAddr>,
    changed: Option<SocketAddr>,
}

impl StunResponse {
    fn failed() -> Self {
        Self::default()
    }
}

/// STUN prober; remembers the server address between probes
pub struct Stun {
    config: StunConfig,
    stun_ip: Option<IpAddr>,
    throttler: LogThrottler,
}

impl Stun {
    pub fn new(config: StunConfig) -> Self {
        Self {
            config,
            stun_ip: None,
            throttler: LogThrottler::with_secs(60),
        }
    }

    /// Probe from `src_ip:src_port`; errors are logged and yield
    /// [`StunNatType::Error`]
    pub async fn get_info(&mut self, src_ip: IpAddr, src_port: u16) -> StunInfo {
        let mut info = StunInfo {
            src_ip: src_ip.to_string(),
            stun_host: self.config.host.clone(),
            stun_port: self.config.port,
            ..Default::default()
        };

        match self.probe(SocketAddr::new(src_ip, src_port)).await {
            Ok((nat_type, resp)) => {
                self.throttler.clear("probe");
                info.nat_type = nat_type;
                info.ext_ip = resp.ext.map(|a| a.ip().to_string()).unwrap_or_default();
            }
            Err(e) => error_throttled!(self.throttler, "probe", "Can't get STUN info: {}", e),
        }
        info.stun_ip = self.stun_ip.map(|ip| ip.to_string()).unwrap_or_default();
        info
    }

    async fn probe(&mut self, src: SocketAddr) -> Result<(StunNatType, StunResponse)> {
        let stun_ips: Vec<IpAddr> = self
            .resolve()
            .await?
            .into_iter()
            .filter(|ip| ip.is_ipv4() == src.is_ipv4())
            .collect();
        if stun_ips.is_empty() {
            return Err(AppError::Stun(format!(
                "Can't resolve {} address for STUN",
                if src.is_ipv4() { "IPv4" } else { "IPv6" }
            )));
        }
        let stun_ip = match self.stun_ip {
            Some(ip) if stun_ips.contains(&ip) => ip,
            _ => stun_ips[0],
        };
        self.stun_ip = Some(stun_ip);

        let socket = UdpSocket::from_std(bind_udp_socket(src)?)?;
        self.nat_type(&socket, src.ip(), stun_ip).await
    }

    async fn resolve(&self) -> Result<Vec<IpAddr>> {
        let mut attempts = self.config.retries.max(1);
        loop {
            match tokio::net::lookup_host((self.config.host.as_str(), self.config.port)).await {
                Ok(addrs) => return Ok(addrs.map(|a| a.ip()).collect()),
                Err(e) => {
                    attempts -= 1;
                    if attempts == 0 {
                        return Err(AppError::Stun(format!(
                            "Can't resolve {}: {}",
                            self.config.host, e
                        )));
                    }
                }
            }
            tokio::time::sleep(self.config.retries_delay()).await;
        }
    }

    async fn nat_type(
        &self,
        socket: &UdpSocket,
        src_ip: IpAddr,
        stun_ip: IpAddr,
    ) -> Result<(StunNatType, StunResponse)> {
        let server = SocketAddr::new(stun_ip, self.config.port);

        let first = self.request(socket, "First probe", server, &[]).await?;
        if !first.ok {
            return Ok((StunNatType::Blocked, first));
        }

        let change_all = change_request(CHANGE_IP_AND_PORT);
        let resp = self
            .request(socket, "Change request [ext_ip == src_ip]", server, &change_all)
            .await?;

        if first.ext.map(|a| a.ip()) == Some(src_ip) {
            let nat_type = if resp.ok {
                StunNatType::OpenInternet
            } else {
                StunNatType::SymmetricUdpFirewall
            };
            return Ok((nat_type, resp));
        }

        if resp.ok {
            return Ok((StunNatType::FullConeNat, resp));
        }

        let changed = first.changed.ok_or_else(|| {
            AppError::Stun(format!("Changed address is missing: {:?}", first))
        })?;
        let resp = self
            .request(socket, "Change request [ext_ip != src_ip]", changed, &[])
            .await?;
        if !resp.ok {
            return Ok((StunNatType::ChangedAddrError, resp));
        }

        if resp.ext == first.ext {
            let change_port = change_request(CHANGE_PORT);
            let addr = SocketAddr::new(changed.ip(), self.config.port);
            let resp = self
                .request(socket, "Change port", addr, &change_port)
                .await?;
            let nat_type = if resp.ok {
                StunNatType::RestrictedNat
            } else {
                StunNatType::RestrictedPortNat
            };
            return Ok((nat_type, resp));
        }

        Ok((StunNatType::SymmetricNat, resp))
    }

    /// Send one binding request, retrying on timeouts and bad replies
    ///
    /// Running out of attempts is a failed response, not an error. Only a
    /// reply with malformed attributes is an error.
    async fn request(
        &self,
        socket: &UdpSocket,
        ctx: &str,
        addr: SocketAddr,
        attrs: &[u8],
    ) -> Result<StunResponse> {
        let id = new_transaction_id();
        let msg = encode_request(&id, attrs);
        let retries = self.config.retries.max(1);

        let mut last_error = String::new();
        for attempt in 0..retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retries_delay()).await;
            }
            match self.exchange(socket, &msg, &id, addr).await {
                Ok(body) => {
                    let resp = parse_attributes(&body, &id)?;
                    debug!(
                        "{}: ext={:?} src={:?} changed={:?}",
                        ctx, resp.ext, resp.src, resp.changed
                    );
                    return Ok(resp);
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        info!(
            "{}: Can't perform STUN request after {} retries; last error: {}",
            ctx, retries, last_error
        );
        Ok(StunResponse::failed())
    }

    async fn exchange(
        &self,
        socket: &UdpSocket,
        msg: &[u8],
        id: &[u8; 16],
        addr: SocketAddr,
    ) -> Result<Vec<u8>> {
        socket.send_to(msg, addr).await?;
        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(self.config.timeout(), socket.recv_from(&mut buf))
            .await
            .map_err(|_| AppError::Stun("timed out".to_string()))??;
        Ok(check_response(&buf[..len], id)?.to_vec())
    }
}

fn new_transaction_id() -> [u8; 16] {
    let mut id = [0u8; 16];
    id[..4].copy_from_slice(&MAGIC_COOKIE);
    rand::Rng::fill(&mut rand::thread_rng(), &mut id[4..]);
    id
}

fn change_request(flags: u32) -> Vec<u8> {
    let mut attr = Vec::with_capacity(8);
    attr.extend_from_slice(&ATTR_CHANGE_REQUEST.to_be_bytes());
    attr.extend_from_slice(&4u16.to_be_bytes());
    attr.extend_from_slice(&flags.to_be_bytes());
    attr
}

fn encode_request(id: &[u8; 16], attrs: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20 + attrs.len());
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    msg.extend_from_slice(id);
    msg.extend_from_slice(attrs);
    msg
}

/// Validate the header and return the attribute section
fn check_response<'a>(data: &'a [u8], id: &[u8; 16]) -> Result<&'a [u8]> {
    if data.len() < 20 {
        return Err(AppError::Stun("Response is too short".to_string()));
    }
    if u16::from_be_bytes([data[0], data[1]]) != BINDING_RESPONSE {
        return Err(AppError::Stun("Invalid response type".to_string()));
    }
    if &data[4..20] != id {
        return Err(AppError::Stun("Transaction ID mismatch".to_string()));
    }
    Ok(&data[20..])
}

fn parse_attributes(body: &[u8], id: &[u8; 16]) -> Result<StunResponse> {
    let mut resp = StunResponse {
        ok: true,
        ..Default::default()
    };

    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let start = offset + 4;
        let value = &body[start..(start + attr_len).min(body.len())];

        match attr_type {
            ATTR_MAPPED_ADDRESS => resp.ext = Some(parse_address(value, None)?),
            ATTR_XOR_MAPPED_ADDRESS => resp.ext = Some(parse_address(value, Some(id))?),
            ATTR_SOURCE_ADDRESS => resp.src = Some(parse_address(value, None)?),
            ATTR_CHANGED_ADDRESS => resp.changed = Some(parse_address(value, None)?),
            _ => {}
        }
        // Attributes are padded to 32 bits
        offset = start + attr_len.div_ceil(4) * 4;
    }
    Ok(resp)
}

/// Decode a (XOR-)MAPPED-ADDRESS style value; `xor` is the cookie and
/// transaction id
fn parse_address(data: &[u8], xor: Option<&[u8; 16]>) -> Result<SocketAddr> {
    if data.len() < 4 {
        return Err(AppError::Stun("Address: data is too short".to_string()));
    }
    let key = |i: usize| xor.map(|id| id[i]).unwrap_or(0);

    let port = u16::from_be_bytes([data[2] ^ key(0), data[3] ^ key(1)]);
    let ip = match data[1] {
        0x01 => {
            if data.len() < 8 {
                return Err(AppError::Stun("IPv4 address: data is too short".to_string()));
            }
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = data[4 + i] ^ key(i);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            if data.len() < 20 {
                return Err(AppError::Stun("IPv6 address: data is too short".to_string()));
            }
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = data[4 + i] ^ key(i);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => {
            return Err(AppError::Stun(format!("Invalid address family: {}", family)));
        }
    };
    Ok(SocketAddr::new(ip, port))
}
