//! Lenient deserializers shared by the overlay and compose project models.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::{Environment, Labels, Named};

/// `Vec<T>` stored on disk as a mapping of name -> entity, in document order.
pub(crate) mod named_list {
    use super::*;

    pub fn serialize<S, T>(items: &[T], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Named + Serialize,
    {
        let mut map = s.serialize_map(Some(items.len()))?;
        for it in items { map.serialize_entry(it.name(), it)?; }
        map.end()
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Named + Deserialize<'de> + Default,
    {
        struct ListVisitor<T>(PhantomData<T>);

        impl<'de, T: Named + Deserialize<'de> + Default> Visitor<'de> for ListVisitor<T> {
            type Value = Vec<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of name to entity")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> { Ok(Vec::new()) }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> { Ok(Vec::new()) }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out: Vec<T> = Vec::new();
                while let Some((name, item)) = access.next_entry::<String, Option<T>>()? {
                    if out.iter().any(|x| x.name() == name) {
                        return Err(de::Error::custom(format!("duplicate entry `{}`", name)));
                    }
                    let mut item = item.unwrap_or_default();
                    item.set_name(name);
                    out.push(item);
                }
                Ok(out)
            }
        }

        d.deserialize_any(ListVisitor(PhantomData))
    }
}

/// `BTreeMap<String, T>` whose values learn their own key on load.
pub(crate) mod named_map {
    use super::*;

    pub fn serialize<S, T>(items: &BTreeMap<String, T>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        s.collect_map(items.iter())
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<BTreeMap<String, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Named + Deserialize<'de> + Default,
    {
        let raw: Option<BTreeMap<String, Option<T>>> = Option::deserialize(d)?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .map(|(name, item)| {
                let mut item = item.unwrap_or_default();
                item.set_name(name.clone());
                (name, item)
            })
            .collect())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrMap {
    List(Vec<String>),
    Map(BTreeMap<String, Json>),
}

fn scalar_to_string(v: &Json) -> Option<String> {
    match v {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        Json::Bool(b) => Some(b.to_string()),
        Json::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Labels as `{k: v}` or `["k=v"]`.
pub(crate) fn labels<'de, D: Deserializer<'de>>(d: D) -> Result<Labels, D::Error> {
    let raw: Option<ListOrMap> = Option::deserialize(d)?;
    Ok(match raw {
        None => Labels::new(),
        Some(ListOrMap::List(items)) => items
            .into_iter()
            .map(|it| match it.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (it, String::new()),
            })
            .collect(),
        Some(ListOrMap::Map(m)) => m
            .into_iter()
            .map(|(k, v)| {
                let v = scalar_to_string(&v).unwrap_or_default();
                (k, v)
            })
            .collect(),
    })
}

/// Environment as `{K: v}` or `["K=v", "K"]`; a bare `K` has no value.
pub(crate) fn environment<'de, D: Deserializer<'de>>(d: D) -> Result<Environment, D::Error> {
    let raw: Option<ListOrMap> = Option::deserialize(d)?;
    Ok(match raw {
        None => Environment::new(),
        Some(ListOrMap::List(items)) => items
            .into_iter()
            .map(|it| match it.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (it, None),
            })
            .collect(),
        Some(ListOrMap::Map(m)) => m.into_iter().map(|(k, v)| { let v = scalar_to_string(&v); (k, v) }).collect(),
    })
}

/// Rewrite a list-form `labels` tree as a map so trees merge key by key.
pub fn labels_as_map(value: Json) -> Result<Json, serde_json::Error> {
    serde_json::to_value(labels(value)?)
}

/// Rewrite a list-form `environment` tree as a map; a bare `K` becomes `null`.
pub fn environment_as_map(value: Json) -> Result<Json, serde_json::Error> {
    serde_json::to_value(environment(value)?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(f64),
    Str(String),
}

/// CPU count as `0.5` or `"0.5"`.
pub(crate) fn cpus<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<NumOrString>::deserialize(d)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) => s.trim().parse::<f64>().map(Some).map_err(|_| de::Error::custom(format!("invalid cpus value `{}`", s))),
    }
}

static BYTES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*([kmgtp]?)i?b?\s*$").expect("static regex"));

/// Parse a docker-style byte size (`512m`, `1gb`, `100k`, `2048`). Units are binary.
pub fn parse_bytes(s: &str) -> Option<u64> {
    let caps = BYTES_RE.captures(s)?;
    let n: f64 = caps.get(1)?.as_str().parse().ok()?;
    let exp = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
        Some("k") => 1,
        Some("m") => 2,
        Some("g") => 3,
        Some("t") => 4,
        Some("p") => 5,
        _ => 0,
    };
    Some((n * 1024f64.powi(exp)).round() as u64)
}

/// Memory as raw bytes or a unit string.
pub(crate) fn bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    match Option::<NumOrString>::deserialize(d)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) if n >= 0.0 => Ok(Some(n.round() as u64)),
        Some(NumOrString::Num(n)) => Err(de::Error::custom(format!("negative byte size {}", n))),
        Some(NumOrString::Str(s)) => parse_bytes(&s).map(Some).ok_or_else(|| de::Error::custom(format!("invalid byte size `{}`", s))),
    }
}
