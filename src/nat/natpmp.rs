//! NAT-PMP (RFC 6886) client: wire encoding, gateway discovery, and a
//! UDP-backed client with bounded retries.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{NatPmpError, NatPmpResultCode};
use crate::nat::Protocol;

pub const NAT_PMP_PORT: u16 = 5351;
const NAT_PMP_VERSION: u8 = 0;
const OPCODE_PUBLIC_ADDRESS_REQUEST: u8 = 0;
const OPCODE_UDP_MAPPING_REQUEST: u8 = 1;
const OPCODE_TCP_MAPPING_REQUEST: u8 = 2;

/// The outcome of a successful NAT-PMP `add_port_mapping` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NatPmpMapping {
    pub internal_port: u16,
    pub external_port: u16,
    pub lifetime: u32,
    pub protocol: Protocol,
}

fn opcode_for(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Tcp => OPCODE_TCP_MAPPING_REQUEST,
        Protocol::Udp => OPCODE_UDP_MAPPING_REQUEST,
    }
}

pub fn encode_public_address_request() -> [u8; 2] {
    [NAT_PMP_VERSION, OPCODE_PUBLIC_ADDRESS_REQUEST]
}

pub fn encode_port_mapping_request(
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
    protocol: Protocol,
) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = NAT_PMP_VERSION;
    buf[1] = opcode_for(protocol);
    // buf[2..4] reserved, left zero
    buf[4..6].copy_from_slice(&internal_port.to_be_bytes());
    buf[6..8].copy_from_slice(&external_port.to_be_bytes());
    buf[8..12].copy_from_slice(&lifetime.to_be_bytes());
    buf
}

pub fn decode_public_address_response(data: &[u8]) -> Result<(Ipv4Addr, u32), NatPmpError> {
    if data.len() < 12 {
        return Err(NatPmpError::MalformedResponse);
    }
    let result = u16::from_be_bytes([data[2], data[3]]);
    if result != 0 {
        return Err(NatPmpError::Result(NatPmpResultCode::from(result)));
    }
    let seconds = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let ip = Ipv4Addr::new(data[8], data[9], data[10], data[11]);
    Ok((ip, seconds))
}

pub fn decode_port_mapping_response(data: &[u8]) -> Result<NatPmpMapping, NatPmpError> {
    if data.len() < 16 {
        return Err(NatPmpError::MalformedResponse);
    }
    let opcode = data[1];
    let result = u16::from_be_bytes([data[2], data[3]]);
    if result != 0 {
        return Err(NatPmpError::Result(NatPmpResultCode::from(result)));
    }
    let internal_port = u16::from_be_bytes([data[8], data[9]]);
    let external_port = u16::from_be_bytes([data[10], data[11]]);
    let lifetime = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    let protocol = if opcode == OPCODE_TCP_MAPPING_REQUEST {
        Protocol::Tcp
    } else {
        Protocol::Udp
    };
    Ok(NatPmpMapping {
        internal_port,
        external_port,
        lifetime,
        protocol,
    })
}

/// Parses the gateway address out of `route print 0.0.0.0` (Windows).
fn parse_windows_route_output(output: &str) -> Option<Ipv4Addr> {
    for line in output.lines() {
        if line.contains("0.0.0.0") && !line.contains("On-Link") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                if let Ok(ip) = parts[2].parse() {
                    return Some(ip);
                }
            }
        }
    }
    None
}

/// Parses the gateway address out of `ip route show default` (Linux) or
/// `route -n get default` (macOS) output.
fn parse_unix_route_output(output: &str) -> Option<Ipv4Addr> {
    for line in output.lines() {
        if line.contains("via") || line.contains("gateway:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            for (i, part) in parts.iter().enumerate() {
                if (*part == "via" || *part == "gateway:") && i + 1 < parts.len() {
                    let candidate = parts[i + 1].split('/').next().unwrap_or("");
                    if let Ok(ip) = candidate.parse() {
                        return Some(ip);
                    }
                }
            }
        }
    }
    None
}

/// Discovers the NAT gateway by parsing the operating system's default
/// route. Returns `None` (not an error) if the platform tooling is
/// unavailable or nothing could be parsed; the caller treats "no gateway"
/// as non-fatal.
pub async fn discover_gateway() -> Option<Ipv4Addr> {
    if cfg!(target_os = "windows") {
        let output = Command::new("route")
            .args(["print", "0.0.0.0"])
            .output()
            .await
            .ok()?;
        parse_windows_route_output(&String::from_utf8_lossy(&output.stdout))
    } else {
        if let Ok(output) = Command::new("ip").args(["route", "show", "default"]).output().await {
            if let Some(ip) = parse_unix_route_output(&String::from_utf8_lossy(&output.stdout)) {
                return Some(ip);
            }
        }
        let output = Command::new("route")
            .args(["-n", "get", "default"])
            .output()
            .await
            .ok()?;
        parse_unix_route_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// A NAT-PMP client bound to a single gateway.
pub struct NatPmpClient {
    gateway_ip: Option<Ipv4Addr>,
    timeout: Duration,
    max_retries: u32,
}

impl NatPmpClient {
    pub fn new(gateway_ip: Option<Ipv4Addr>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            gateway_ip,
            timeout,
            max_retries,
        }
    }

    async fn gateway(&mut self) -> Result<Ipv4Addr, NatPmpError> {
        if let Some(ip) = self.gateway_ip {
            return Ok(ip);
        }
        let ip = discover_gateway().await.ok_or(NatPmpError::NoGateway)?;
        self.gateway_ip = Some(ip);
        Ok(ip)
    }

    /// Sends `request` to the gateway, retrying on timeout up to
    /// `max_retries` times with a 1-second gap, and returns the raw
    /// response bytes.
    async fn send_request(&self, gateway: Ipv4Addr, request: &[u8]) -> Result<Vec<u8>, NatPmpError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| NatPmpError::Io(e.to_string()))?;
        let dest = SocketAddr::V4(SocketAddrV4::new(gateway, NAT_PMP_PORT));

        let mut last_timeout = false;
        for attempt in 0..self.max_retries {
            socket
                .send_to(request, dest)
                .await
                .map_err(|e| NatPmpError::Io(e.to_string()))?;
            let mut buf = [0u8; 1024];
            match timeout(self.timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, _))) => return Ok(buf[..n].to_vec()),
                Ok(Err(e)) => return Err(NatPmpError::Io(e.to_string())),
                Err(_) => {
                    last_timeout = true;
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        let _ = last_timeout;
        Err(NatPmpError::Timeout(self.max_retries))
    }

    pub async fn get_external_ip(&mut self) -> Result<Ipv4Addr, NatPmpError> {
        let gateway = self.gateway().await?;
        let request = encode_public_address_request();
        let response = self.send_request(gateway, &request).await?;
        let (ip, _seconds) = decode_public_address_response(&response)?;
        Ok(ip)
    }

    pub async fn add_port_mapping(
        &mut self,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
        protocol: Protocol,
    ) -> Result<NatPmpMapping, NatPmpError> {
        let gateway = self.gateway().await?;
        let request = encode_port_mapping_request(internal_port, external_port, lifetime, protocol);
        let response = self.send_request(gateway, &request).await?;
        let mapping = decode_port_mapping_response(&response)?;
        log::info!(
            "NAT-PMP mapped {} port {} -> {} (lifetime {}s)",
            protocol,
            mapping.internal_port,
            mapping.external_port,
            mapping.lifetime
        );
        Ok(mapping)
    }

    /// Deletes a mapping by requesting a zero lifetime, per RFC 6886 §3.6.
    pub async fn delete_port_mapping(
        &mut self,
        external_port: u16,
        protocol: Protocol,
    ) -> Result<(), NatPmpError> {
        self.add_port_mapping(0, external_port, 0, protocol).await?;
        log::info!("NAT-PMP deleted {} port mapping for {}", protocol, external_port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_public_address_request() {
        assert_eq!(encode_public_address_request(), [0, 0]);
    }

    #[test]
    fn encodes_port_mapping_request_matching_spec_example() {
        // internal=external=6881 (0x1AE1) TCP, lifetime=3600 (0x00000E10)
        let req = encode_port_mapping_request(6881, 6881, 3600, Protocol::Tcp);
        assert_eq!(hex::encode(req), "000200001ae11ae100000e10");
    }

    #[test]
    fn port_mapping_request_layout_is_exact() {
        let req = encode_port_mapping_request(6881, 6881, 3600, Protocol::Tcp);
        assert_eq!(req[0], 0);
        assert_eq!(req[1], 2); // TCP opcode
        assert_eq!(u16::from_be_bytes([req[4], req[5]]), 6881);
        assert_eq!(u16::from_be_bytes([req[6], req[7]]), 6881);
        assert_eq!(u32::from_be_bytes([req[8], req[9], req[10], req[11]]), 3600);
    }

    #[test]
    fn decodes_public_address_response() {
        let mut data = vec![0u8, 0, 0, 0];
        data.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        data.extend_from_slice(&[203, 0, 113, 1]);
        let (ip, seconds) = decode_public_address_response(&data).unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 1));
        assert_eq!(seconds, 1_700_000_000);
    }

    #[test]
    fn decodes_port_mapping_response_matching_spec_example() {
        let mut data = vec![0u8, 0x82, 0, 0];
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&6881u16.to_be_bytes());
        data.extend_from_slice(&6881u16.to_be_bytes());
        data.extend_from_slice(&3600u32.to_be_bytes());
        let mapping = decode_port_mapping_response(&data).unwrap();
        assert_eq!(
            mapping,
            NatPmpMapping {
                internal_port: 6881,
                external_port: 6881,
                lifetime: 3600,
                protocol: Protocol::Tcp,
            }
        );
    }

    #[test]
    fn nonzero_result_code_is_mapped_to_error() {
        let mut data = vec![0u8, 0, 0, 2]; // result=2 NOT_AUTHORIZED
        data.extend_from_slice(&[0u8; 8]);
        let err = decode_public_address_response(&data).unwrap_err();
        match err {
            NatPmpError::Result(NatPmpResultCode::NotAuthorized) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn windows_route_output_is_parsed() {
        let output = "\
===========================================================================
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0    192.168.1.1    192.168.1.100     25
";
        assert_eq!(
            parse_windows_route_output(output),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
    }

    #[test]
    fn linux_ip_route_output_is_parsed() {
        let output = "default via 192.168.1.1 dev eth0 proto dhcp metric 100\n";
        assert_eq!(
            parse_unix_route_output(output),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
    }
}
