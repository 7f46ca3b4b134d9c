//! In-memory compose project: the subset of compose fields komp reads, with
//! every other service key carried through untouched in `extras`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::serde_util;
use crate::{Environment, Extensions, Labels, Named, EXTENSION_KEY};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeProject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, with = "serde_util::named_list", skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
    #[serde(default, with = "serde_util::named_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeConfig>,
    /// Top-level keys komp does not interpret (networks, secrets, x-*).
    #[serde(flatten)]
    pub extras: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "serde_util::labels")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "serde_util::environment")]
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheckConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ServiceVolumeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// `x-*` extensions and any other service keys (command, build, ...).
    #[serde(flatten)]
    pub extras: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_config: Option<UpdateConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<ResourceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Fractional cores.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "serde_util::cpus")]
    pub cpus: Option<f64>,
    /// Bytes.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "serde_util::bytes")]
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Normalized to list form: `["CMD", ...]`, `["CMD-SHELL", "..."]` or `["NONE"]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "health_test")]
    pub test: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
}

fn health_test<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw { Shell(String), List(Vec<String>) }
    Ok(match Option::<Raw>::deserialize(d)? {
        None => Vec::new(),
        Some(Raw::Shell(s)) => vec!["CMD-SHELL".to_string(), s],
        Some(Raw::List(v)) => v,
    })
}

/// Port mapping in long form. Short syntax (`"8080:80/tcp"`, `"80"`, `80`) is accepted on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPort")]
pub struct PortConfig {
    pub target: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// `ingress` or `host`; compose treats a missing mode as `ingress`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(u64),
    Str(String),
}

impl NumOrStr {
    fn into_string(self) -> String {
        match self { NumOrStr::Num(n) => n.to_string(), NumOrStr::Str(s) => s }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Num(u32),
    Short(String),
    Long {
        target: u32,
        #[serde(default)]
        published: Option<NumOrStr>,
        #[serde(default)]
        host_ip: Option<String>,
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        mode: Option<String>,
    },
}

impl TryFrom<RawPort> for PortConfig {
    type Error = String;

    fn try_from(raw: RawPort) -> Result<Self, Self::Error> {
        match raw {
            RawPort::Num(target) => Ok(PortConfig { target, ..Default::default() }),
            RawPort::Long { target, published, host_ip, protocol, mode } => Ok(PortConfig {
                target,
                published: published.map(NumOrStr::into_string),
                host_ip,
                protocol,
                mode,
            }),
            RawPort::Short(s) => parse_short_port(&s),
        }
    }
}

fn parse_short_port(s: &str) -> Result<PortConfig, String> {
    let (spec, protocol) = match s.rsplit_once('/') {
        Some((spec, proto)) => (spec, Some(proto.to_string())),
        None => (s, None),
    };
    // "[::1]:8080:80" carries a bracketed IPv6 host
    let (bracketed, spec) = match spec.strip_prefix('[').and_then(|rest| rest.split_once("]:")) {
        Some((ip, rest)) => (Some(ip), rest),
        None => (None, spec),
    };
    let parts: Vec<&str> = spec.split(':').collect();
    let (host_ip, published, target) = match (bracketed, parts.as_slice()) {
        (None, [target]) => (None, None, *target),
        (None, [published, target]) => (None, Some(*published), *target),
        (None, [ip, published, target]) => (Some(*ip), Some(*published), *target),
        (Some(ip), [published, target]) => (Some(ip), Some(*published), *target),
        _ => return Err(format!("invalid port mapping `{}`", s)),
    };
    // "8000-8001" ranges map to their first port
    let target_first = target.split('-').next().unwrap_or(target);
    let target: u32 = target_first.parse().map_err(|_| format!("invalid container port in `{}`", s))?;
    Ok(PortConfig {
        target,
        published: published.filter(|p| !p.is_empty()).map(|p| p.to_string()),
        host_ip: host_ip.filter(|ip| !ip.is_empty()).map(|ip| ip.to_string()),
        protocol,
        mode: None,
    })
}

/// Service volume mount in long form. Short syntax (`data:/var/lib/data:ro`) is accepted on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMount")]
pub struct ServiceVolumeConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMount {
    Short(String),
    Long {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        source: Option<String>,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
}

impl TryFrom<RawMount> for ServiceVolumeConfig {
    type Error = String;

    fn try_from(raw: RawMount) -> Result<Self, Self::Error> {
        match raw {
            RawMount::Long { kind, source, target, read_only } => Ok(Self { kind, source, target, read_only }),
            RawMount::Short(s) => {
                let parts: Vec<&str> = s.split(':').collect();
                match parts.as_slice() {
                    [target] => Ok(Self { kind: Some("volume".into()), source: None, target: (*target).to_string(), read_only: false }),
                    [source, target] | [source, target, _] => {
                        let read_only = parts.get(2).map(|m| m.split(',').any(|f| f == "ro")).unwrap_or(false);
                        let bind = source.starts_with('.') || source.starts_with('/') || source.starts_with('~');
                        Ok(Self {
                            kind: Some(if bind { "bind" } else { "volume" }.into()),
                            source: Some((*source).to_string()),
                            target: (*target).to_string(),
                            read_only,
                        })
                    }
                    _ => Err(format!("invalid volume mount `{}`", s)),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "serde_util::labels")]
    pub labels: Labels,
    #[serde(flatten)]
    pub extras: BTreeMap<String, Json>,
}

impl Named for ServiceConfig {
    fn name(&self) -> &str { &self.name }
    fn set_name(&mut self, name: String) { self.name = name; }
}

impl Named for VolumeConfig {
    fn name(&self) -> &str { &self.name }
    fn set_name(&mut self, name: String) { self.name = name; }
}

fn extension_of(extras: &BTreeMap<String, Json>) -> Option<&Extensions> {
    extras.get(EXTENSION_KEY).and_then(|v| v.as_object())
}

fn extension_mut_of(extras: &mut BTreeMap<String, Json>) -> &mut Extensions {
    let slot = extras.entry(EXTENSION_KEY.to_string()).or_insert_with(|| Json::Object(Extensions::new()));
    if !slot.is_object() { *slot = Json::Object(Extensions::new()); }
    match slot {
        Json::Object(map) => map,
        _ => unreachable!("slot was just made an object"),
    }
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// The service's own `x-komp` extension, if declared.
    pub fn extension(&self) -> Option<&Extensions> { extension_of(&self.extras) }

    pub fn extension_mut(&mut self) -> &mut Extensions { extension_mut_of(&mut self.extras) }

    pub fn is_global(&self) -> bool {
        self.deploy.as_ref().and_then(|d| d.mode.as_deref()) == Some("global")
    }
}

impl VolumeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn extension(&self) -> Option<&Extensions> { extension_of(&self.extras) }

    pub fn extension_mut(&mut self) -> &mut Extensions { extension_mut_of(&mut self.extras) }
}

impl ComposeProject {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceConfig> {
        self.services.iter_mut().find(|s| s.name == name)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE: &str = r#"
version: "3.7"
services:
  web:
    image: nginx
    command: ["nginx", "-g", "daemon off;"]
    labels:
      - komp.service.expose=true
    environment:
      - MODE=prod
      - TOKEN
    ports:
      - "8080:80"
      - target: 443
        published: 8443
        mode: host
    deploy:
      replicas: 2
      resources:
        limits: { cpus: "0.5", memory: 512m }
        reservations: { cpus: 0.25, memory: 10485760 }
    healthcheck:
      test: curl -f http://localhost
      interval: 30s
    x-komp:
      workload:
        replicas: 5
  db:
    image: postgres
    volumes:
      - data:/var/lib/postgresql/data:ro
      - ./init:/docker-entrypoint-initdb.d
volumes:
  data:
    labels:
      tier: storage
"#;

    #[test]
    fn compose_fields_parse_leniently() {
        let p = ComposeProject::from_yaml(COMPOSE).unwrap();
        assert_eq!(p.version.as_deref(), Some("3.7"));
        let web = p.service("web").unwrap();
        assert_eq!(web.labels["komp.service.expose"], "true");
        assert_eq!(web.environment["MODE"], Some("prod".to_string()));
        assert_eq!(web.environment["TOKEN"], None);
        assert_eq!(web.ports[0].target, 80);
        assert_eq!(web.ports[0].published.as_deref(), Some("8080"));
        assert_eq!(web.ports[1].published.as_deref(), Some("8443"));
        assert_eq!(web.ports[1].mode.as_deref(), Some("host"));
        let res = web.deploy.as_ref().unwrap().resources.as_ref().unwrap();
        assert_eq!(res.limits.as_ref().unwrap().cpus, Some(0.5));
        assert_eq!(res.limits.as_ref().unwrap().memory, Some(512 * 1024 * 1024));
        assert_eq!(res.reservations.as_ref().unwrap().memory, Some(10_485_760));
        assert_eq!(web.healthcheck.as_ref().unwrap().test, vec!["CMD-SHELL", "curl -f http://localhost"]);
        assert_eq!(web.extension().unwrap()["workload"]["replicas"], serde_json::json!(5));
        assert!(web.extras.contains_key("command"));

        let db = p.service("db").unwrap();
        assert_eq!(db.volumes[0].kind.as_deref(), Some("volume"));
        assert!(db.volumes[0].read_only);
        assert_eq!(db.volumes[1].kind.as_deref(), Some("bind"));
        assert_eq!(p.volumes["data"].name, "data");
        assert_eq!(p.volumes["data"].labels["tier"], "storage");
    }

    #[test]
    fn project_survives_yaml_round_trip() {
        let p = ComposeProject::from_yaml(COMPOSE).unwrap();
        let again = ComposeProject::from_yaml(&p.to_yaml().unwrap()).unwrap();
        assert_eq!(again, p);
    }

    #[test]
    fn short_ports_accept_ipv6_hosts() {
        let p = parse_short_port("[::1]:8080:80/udp").unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("::1"));
        assert_eq!(p.published.as_deref(), Some("8080"));
        assert_eq!(p.target, 80);
        assert_eq!(p.protocol.as_deref(), Some("udp"));
        let v4 = parse_short_port("127.0.0.1:8080:80").unwrap();
        assert_eq!(v4.host_ip.as_deref(), Some("127.0.0.1"));
        assert!(parse_short_port("[::1]:80").is_err());
        assert!(parse_short_port("a:b:c:d").is_err());
    }

    #[test]
    fn extension_mut_creates_namespace() {
        let mut svc = ServiceConfig::new("x");
        svc.extension_mut().insert("k".into(), serde_json::json!(1));
        assert_eq!(svc.extension().unwrap()["k"], serde_json::json!(1));
    }
}
