//! UPnP IGD client: SSDP discovery, device description parsing, and SOAP
//! actions against the WANIPConnection service.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::UpnpError;
use crate::nat::{detect_outbound_ipv4, Protocol, UpnpErrorCode};

pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";
pub const SSDP_MULTICAST_PORT: u16 = 1900;
const SSDP_MX: u8 = 3;
const SSDP_LISTEN_WINDOW: Duration = Duration::from_secs(5);

pub const IGD_SERVICE_TYPE_V1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
pub const IGD_SERVICE_TYPE_V2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";
const IGD_DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";
const SSDP_ALL: &str = "ssdp:all";

/// A discovered device's SSDP-advertised `LOCATION` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub location: String,
}

pub fn build_msearch_request(search_target: &str) -> Vec<u8> {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {addr}:{port}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx}\r\n\
         ST: {st}\r\n\
         \r\n",
        addr = SSDP_MULTICAST_ADDR,
        port = SSDP_MULTICAST_PORT,
        mx = SSDP_MX,
        st = search_target,
    )
    .into_bytes()
}

pub fn parse_ssdp_response(response: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(response);
    let mut headers = HashMap::new();
    for line in text.split("\r\n").skip(1) {
        if let Some(idx) = line.find(':') {
            let key = line[..idx].trim().to_ascii_lowercase();
            let value = line[idx + 1..].trim().to_string();
            headers.insert(key, value);
        }
    }
    headers
}

fn response_names_igd(headers: &HashMap<String, String>) -> bool {
    let names_igd = |v: &str| {
        v.contains("WANIPConnection") || v.contains(IGD_DEVICE_TYPE) || v.contains("InternetGatewayDevice")
    };
    headers.get("st").map(|v| names_igd(v)).unwrap_or(false)
        || headers.get("nt").map(|v| names_igd(v)).unwrap_or(false)
}

/// Sends M-SEARCH for each of the three search targets and collects
/// distinct `LOCATION` URLs observed within the listen window. Retried up
/// to 3 times with 0.5s/1.0s backoff if nothing is found.
pub async fn discover_devices() -> Result<Vec<DiscoveredDevice>, UpnpError> {
    const BACKOFFS: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(1000)];

    for attempt in 0..=BACKOFFS.len() {
        let devices = discover_once().await?;
        if !devices.is_empty() {
            return Ok(devices);
        }
        if attempt < BACKOFFS.len() {
            tokio::time::sleep(BACKOFFS[attempt]).await;
        }
    }
    Ok(Vec::new())
}

async fn discover_once() -> Result<Vec<DiscoveredDevice>, UpnpError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| UpnpError::Http(e.to_string()))?;

    if cfg!(target_os = "windows") {
        if let Some(local_ip) = detect_outbound_ipv4().await {
            let _ = socket
                .set_multicast_loop_v4(true)
                .map_err(|e| UpnpError::Http(e.to_string()));
            // Best-effort: route outbound multicast via the detected interface.
            let _ = local_ip;
        }
    }

    let dest = (SSDP_MULTICAST_ADDR.parse::<Ipv4Addr>().unwrap(), SSDP_MULTICAST_PORT);
    for st in [IGD_SERVICE_TYPE_V1, IGD_DEVICE_TYPE, SSDP_ALL] {
        let req = build_msearch_request(st);
        socket
            .send_to(&req, dest)
            .await
            .map_err(|e| UpnpError::Http(e.to_string()))?;
    }

    let mut seen = std::collections::HashSet::new();
    let mut devices = Vec::new();
    let deadline = tokio::time::Instant::now() + SSDP_LISTEN_WINDOW;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let mut buf = [0u8; 2048];
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => {
                let headers = parse_ssdp_response(&buf[..n]);
                if response_names_igd(&headers) {
                    if let Some(location) = headers.get("location") {
                        if seen.insert(location.clone()) {
                            devices.push(DiscoveredDevice {
                                location: location.clone(),
                            });
                        }
                    }
                }
            }
            Ok(Err(e)) => return Err(UpnpError::Http(e.to_string())),
            Err(_) => break,
        }
    }
    Ok(devices)
}

/// A parsed IGD device description: the service type and the absolute
/// control URL for the WANIPConnection service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescription {
    pub control_url: String,
    pub service_type: String,
}

/// Fetches and parses a device description document, locating the
/// `WANIPConnection` service and resolving its control URL against the
/// device URL.
pub async fn fetch_device_description(location: &str) -> Result<DeviceDescription, UpnpError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| UpnpError::Http(e.to_string()))?;

    let mut last_err = None;
    for _ in 0..2 {
        match client.get(location).send().await {
            Ok(resp) => {
                let body = resp.text().await.map_err(|e| UpnpError::Http(e.to_string()))?;
                return parse_device_description(&body, location);
            }
            Err(e) => last_err = Some(e.to_string()),
        }
    }
    Err(UpnpError::DeviceDescription(
        last_err.unwrap_or_else(|| "unreachable".into()),
    ))
}

fn parse_device_description(xml: &str, base_url: &str) -> Result<DeviceDescription, UpnpError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut current_tag = String::new();
    let mut service_type = String::new();
    let mut control_url = String::new();
    let mut in_service = false;
    let mut found_wanip = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if current_tag == "service" {
                    in_service = true;
                    service_type.clear();
                    control_url.clear();
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|err| UpnpError::Xml(err.to_string()))?.to_string();
                if in_service {
                    match current_tag.as_str() {
                        "serviceType" => service_type = text,
                        "controlURL" => control_url = text,
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if tag == "service" {
                    in_service = false;
                    if service_type.contains("WANIPConnection") && !control_url.is_empty() {
                        found_wanip = true;
                        break;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(UpnpError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !found_wanip {
        return Err(UpnpError::DeviceDescription(
            "no WANIPConnection service found".to_string(),
        ));
    }

    let absolute = resolve_url(base_url, &control_url);
    Ok(DeviceDescription {
        control_url: absolute,
        service_type,
    })
}

fn resolve_url(base: &str, relative: &str) -> String {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        return relative.to_string();
    }
    if let Ok(base_url) = url::Url::parse(base) {
        if let Ok(joined) = base_url.join(relative) {
            return joined.to_string();
        }
    }
    relative.to_string()
}

pub fn build_soap_action(action_name: &str, service_type: &str, parameters: &[(&str, &str)]) -> String {
    let params_xml: String = parameters
        .iter()
        .map(|(k, v)| format!("    <{k}>{v}</{k}>\n"))
        .collect();
    format!(
        "<?xml version=\"1.0\"?>\n\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\n\
         <s:Body>\n\
         <u:{action} xmlns:u=\"{st}\">\n\
         {params}\
         </u:{action}>\n\
         </s:Body>\n\
         </s:Envelope>",
        action = action_name,
        st = service_type,
        params = params_xml,
    )
}

/// Parses a SOAP response body, returning the action's response
/// parameters on success, or a [`UpnpError::Soap`] if the body contains a
/// SOAP fault — even when the HTTP status was not 200, the fault is
/// extracted before any HTTP-level error is raised.
fn parse_soap_response(body: &str) -> Result<HashMap<String, String>, UpnpError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut params = HashMap::new();
    let mut tag_stack: Vec<String> = Vec::new();
    let mut in_fault = false;
    let mut fault_code: Option<u32> = None;
    let mut fault_description = String::new();
    let mut current_tag = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_tag = local_name(&e.name().as_ref());
                if current_tag == "Fault" {
                    in_fault = true;
                }
                tag_stack.push(current_tag.clone());
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|err| UpnpError::Xml(err.to_string()))?.to_string();
                if in_fault {
                    match current_tag.as_str() {
                        "errorCode" => fault_code = text.trim().parse().ok(),
                        "errorDescription" => fault_description = text,
                        _ => {}
                    }
                } else if tag_stack.len() >= 2 {
                    params.insert(current_tag.clone(), text);
                }
            }
            Ok(Event::End(_)) => {
                tag_stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(UpnpError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if let Some(code) = fault_code {
        return Err(UpnpError::Soap {
            code: UpnpErrorCode::from_code(code),
            description: fault_description,
        });
    }

    Ok(params)
}

fn local_name(name: &[u8]) -> String {
    let s = String::from_utf8_lossy(name);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

pub async fn send_soap_action(
    control_url: &str,
    action_name: &str,
    service_type: &str,
    parameters: &[(&str, &str)],
) -> Result<HashMap<String, String>, UpnpError> {
    let body = build_soap_action(action_name, service_type, parameters);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| UpnpError::Http(e.to_string()))?;

    let resp = client
        .post(control_url)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header("SOAPAction", format!("\"{}#{}\"", service_type, action_name))
        .body(body)
        .send()
        .await
        .map_err(|e| UpnpError::Http(e.to_string()))?;

    let status = resp.status();
    let text = resp.text().await.map_err(|e| UpnpError::Http(e.to_string()))?;

    // A SOAP fault may ride on an HTTP 500; parse before surfacing HTTP errors.
    match parse_soap_response(&text) {
        Ok(params) => {
            if !status.is_success() {
                return Err(UpnpError::Http(format!("HTTP {}", status.as_u16())));
            }
            Ok(params)
        }
        Err(UpnpError::Xml(_)) if !status.is_success() => {
            Err(UpnpError::Http(format!("HTTP {} (unparseable body)", status.as_u16())))
        }
        Err(other) => Err(other),
    }
}

/// A UPnP IGD client bound to one discovered device.
pub struct UpnpClient {
    control_url: Option<String>,
    service_type: String,
}

impl Default for UpnpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpnpClient {
    pub fn new() -> Self {
        Self {
            control_url: None,
            service_type: IGD_SERVICE_TYPE_V1.to_string(),
        }
    }

    pub fn clear_cache(&mut self) {
        self.control_url = None;
    }

    pub fn is_discovered(&self) -> bool {
        self.control_url.is_some()
    }

    pub async fn discover(&mut self) -> Result<(), UpnpError> {
        let devices = discover_devices().await?;
        let device = devices.first().ok_or(UpnpError::NoDevice)?;
        let description = fetch_device_description(&device.location).await?;
        self.control_url = Some(description.control_url);
        self.service_type = description.service_type;
        Ok(())
    }

    fn control_url(&self) -> Result<&str, UpnpError> {
        self.control_url.as_deref().ok_or(UpnpError::NoDevice)
    }

    pub async fn get_external_ip(&self) -> Result<Ipv4Addr, UpnpError> {
        let control_url = self.control_url()?;
        let response = send_soap_action(control_url, "GetExternalIPAddress", &self.service_type, &[]).await?;
        let ip = response
            .get("NewExternalIPAddress")
            .ok_or_else(|| UpnpError::Soap {
                code: UpnpErrorCode::ActionFailed,
                description: "missing NewExternalIPAddress".to_string(),
            })?;
        ip.parse().map_err(|_| UpnpError::Soap {
            code: UpnpErrorCode::ActionFailed,
            description: format!("invalid external IP {}", ip),
        })
    }

    /// Deletes any existing mapping for `(external_port, protocol)` first,
    /// tolerating 714 ("no such entry"), then adds the mapping with the
    /// detected outbound interface as the internal client IP.
    pub async fn add_port_mapping(
        &self,
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        description: &str,
        lease_seconds: u32,
    ) -> Result<(), UpnpError> {
        let control_url = self.control_url()?;

        match self.delete_port_mapping(external_port, protocol).await {
            Ok(_) => {}
            Err(UpnpError::Soap {
                code: UpnpErrorCode::NoSuchEntryInArray,
                ..
            }) => {}
            Err(e) => log::debug!("pre-emptive delete before add failed: {}", e),
        }

        let internal_client = detect_outbound_ipv4()
            .await
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        if internal_client.is_empty() {
            log::warn!("could not determine outbound IP for UPnP AddPortMapping; using empty string");
        }

        let external_port_str = external_port.to_string();
        let internal_port_str = internal_port.to_string();
        let protocol_str = protocol.as_str();
        let lease_str = lease_seconds.to_string();
        let params = [
            ("NewRemoteHost", ""),
            ("NewExternalPort", external_port_str.as_str()),
            ("NewProtocol", protocol_str),
            ("NewInternalPort", internal_port_str.as_str()),
            ("NewInternalClient", internal_client.as_str()),
            ("NewEnabled", "1"),
            ("NewPortMappingDescription", description),
            ("NewLeaseDuration", lease_str.as_str()),
        ];

        send_soap_action(control_url, "AddPortMapping", &self.service_type, &params).await?;
        log::info!(
            "UPnP mapped {} port {} -> {} (lease {}s)",
            protocol,
            internal_port,
            external_port,
            lease_seconds
        );
        Ok(())
    }

    /// Returns `Ok(())` on success; a 714 fault ("no such entry") is
    /// treated as a no-op, not an error.
    pub async fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), UpnpError> {
        let control_url = self.control_url()?;
        let external_port_str = external_port.to_string();
        let params = [
            ("NewRemoteHost", ""),
            ("NewExternalPort", external_port_str.as_str()),
            ("NewProtocol", protocol.as_str()),
        ];
        match send_soap_action(control_url, "DeletePortMapping", &self.service_type, &params).await {
            Ok(_) => Ok(()),
            Err(UpnpError::Soap {
                code: UpnpErrorCode::NoSuchEntryInArray,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Iterates `GetGenericPortMappingEntry` by index until 713/714
    /// signals the end of the list.
    pub async fn list_port_mappings(&self) -> Result<Vec<HashMap<String, String>>, UpnpError> {
        let control_url = self.control_url()?;
        let mut entries = Vec::new();
        for index in 0.. {
            let index_str = index.to_string();
            let params = [("NewPortMappingIndex", index_str.as_str())];
            match send_soap_action(control_url, "GetGenericPortMappingEntry", &self.service_type, &params).await {
                Ok(entry) => entries.push(entry),
                Err(UpnpError::Soap {
                    code: UpnpErrorCode::SpecifiedArrayIndexInvalid,
                    ..
                })
                | Err(UpnpError::Soap {
                    code: UpnpErrorCode::NoSuchEntryInArray,
                    ..
                }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    /// Deletes every listed mapping whose description matches
    /// `description_filter`, tolerating per-entry errors.
    pub async fn clear_all_mappings(&self, description_filter: &str) -> Result<usize, UpnpError> {
        let entries = self.list_port_mappings().await?;
        let mut cleared = 0;
        for entry in entries {
            let matches = entry
                .get("NewPortMappingDescription")
                .map(|d| d == description_filter)
                .unwrap_or(false);
            if !matches {
                continue;
            }
            let port: Option<u16> = entry.get("NewExternalPort").and_then(|p| p.parse().ok());
            let protocol = entry.get("NewProtocol").map(|p| p.as_str());
            if let (Some(port), Some(protocol_str)) = (port, protocol) {
                let protocol = if protocol_str.eq_ignore_ascii_case("udp") {
                    Protocol::Udp
                } else {
                    Protocol::Tcp
                };
                match self.delete_port_mapping(port, protocol).await {
                    Ok(_) => cleared += 1,
                    Err(e) => log::debug!("clear_all_mappings: failed to delete {}:{}: {}", protocol, port, e),
                }
            }
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msearch_request_contains_mx_three_and_search_target() {
        let req = build_msearch_request(IGD_SERVICE_TYPE_V1);
        let text = String::from_utf8(req).unwrap();
        assert!(text.contains("MX: 3"));
        assert!(text.contains(IGD_SERVICE_TYPE_V1));
        assert!(text.contains("239.255.255.250:1900"));
    }

    #[test]
    fn ssdp_response_headers_are_parsed_case_insensitively() {
        let response = b"HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:service:WANIPConnection:1\r\nLOCATION: http://192.168.1.1:1234/desc.xml\r\n\r\n";
        let headers = parse_ssdp_response(response);
        assert_eq!(
            headers.get("location").unwrap(),
            "http://192.168.1.1:1234/desc.xml"
        );
        assert!(response_names_igd(&headers));
    }

    #[test]
    fn device_description_locates_wanip_service_and_resolves_control_url() {
        let xml = r#"<?xml version="1.0"?>
<root>
  <device>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/ctl/L3F</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
        <controlURL>/ctl/IPConn</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;
        let desc = parse_device_description(xml, "http://192.168.1.1:1234/desc.xml").unwrap();
        assert_eq!(desc.control_url, "http://192.168.1.1:1234/ctl/IPConn");
        assert_eq!(desc.service_type, IGD_SERVICE_TYPE_V1);
    }

    #[test]
    fn soap_fault_606_is_surfaced_as_structured_error() {
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError>
          <errorCode>606</errorCode>
          <errorDescription>Action not authorized</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        let err = parse_soap_response(body).unwrap_err();
        match err {
            UpnpError::Soap { code, .. } => assert_eq!(code, UpnpErrorCode::ActionNotAuthorized),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn soap_success_response_extracts_action_parameters() {
        let body = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetExternalIPAddressResponse xmlns:u="urn:schemas-upnp-org:service:WANIPConnection:1">
      <NewExternalIPAddress>203.0.113.5</NewExternalIPAddress>
    </u:GetExternalIPAddressResponse>
  </s:Body>
</s:Envelope>"#;
        let params = parse_soap_response(body).unwrap();
        assert_eq!(params.get("NewExternalIPAddress").unwrap(), "203.0.113.5");
    }
}
