//! Server configuration.
//!
//! YAML is the sole config source. The document has three sections: global
//! settings at the top level, a `pathDefaults` block, and a `paths` map whose
//! keys may be literal names, `~`-prefixed regexes, or the catch-all
//! `all_others` (alias `all`).
//!
//! Mutation follows clone → patch → validate: the running config is never
//! edited in place. Per-path entries are kept twice: the raw override value
//! as written (so patching `pathDefaults` re-derives every path), and the
//! effective [`PathConf`] with defaults merged in.

pub mod duration;

use duration::Dur;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("reading config file '{0}': {1}")]
    Io(String, std::io::Error),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Global section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct GlobalConf {
    pub log_level: String,

    pub read_timeout: Dur,
    pub write_timeout: Dur,
    pub write_queue_size: usize,

    pub external_authentication_url: String,

    pub api: bool,
    pub api_address: String,

    pub metrics: bool,
    pub metrics_address: String,

    pub rtsp: bool,
    pub rtsp_address: String,
    pub rtsps_address: String,

    pub rtmp: bool,
    pub rtmp_address: String,
    pub rtmps_address: String,

    pub srt: bool,
    pub srt_address: String,

    pub webrtc: bool,
    pub webrtc_address: String,

    pub hls: bool,
    pub hls_address: String,
    pub hls_always_remux: bool,
    pub hls_segment_count: usize,
    pub hls_segment_duration: Dur,
    pub hls_close_after_inactivity: Dur,

    /// PEM files enabling the TLS listener variants (RTSPS, RTMPS).
    pub server_key: String,
    pub server_cert: String,
}

impl Default for GlobalConf {
    fn default() -> Self {
        GlobalConf {
            log_level: "info".to_owned(),
            read_timeout: Dur::from_secs(10),
            write_timeout: Dur::from_secs(10),
            write_queue_size: 512,
            external_authentication_url: String::new(),
            api: false,
            api_address: "127.0.0.1:9997".to_owned(),
            metrics: false,
            metrics_address: "127.0.0.1:9998".to_owned(),
            rtsp: true,
            rtsp_address: ":8554".to_owned(),
            rtsps_address: String::new(),
            rtmp: true,
            rtmp_address: ":1935".to_owned(),
            rtmps_address: String::new(),
            srt: true,
            srt_address: ":8890".to_owned(),
            webrtc: true,
            webrtc_address: ":8889".to_owned(),
            hls: true,
            hls_address: ":8888".to_owned(),
            hls_always_remux: false,
            hls_segment_count: 7,
            hls_segment_duration: Dur::from_secs(1),
            hls_close_after_inactivity: Dur::from_secs(60),
            server_key: String::new(),
            server_cert: String::new(),
        }
    }
}

impl GlobalConf {
    /// Port of the plain RTSP listener, used in hook environments.
    pub fn rtsp_port(&self) -> u16 {
        addr_port(&self.rtsp_address).unwrap_or(0)
    }

    pub fn tls_configured(&self) -> bool {
        !self.server_key.is_empty() && !self.server_cert.is_empty()
    }
}

/// Normalize a listen address: a bare `:port` or `0.0.0.0` host is widened
/// to the IPv4 wildcard to avoid accidental dual-stack binds.
pub fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    addr.to_owned()
}

fn addr_port(addr: &str) -> Option<u16> {
    addr.rsplit(':').next()?.parse().ok()
}

// ---------------------------------------------------------------------------
// Path section
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PathConf {
    /// `publisher` (default) or a static source URL (`rtsp://`, `rtsps://`).
    pub source: String,
    pub source_on_demand: bool,
    pub source_on_demand_start_timeout: Dur,
    pub source_on_demand_close_after: Dur,
    pub source_retry_pause: Dur,

    pub disable_publisher_override: bool,
    /// Path name or URL answered to DESCRIBE when nothing is publishing.
    pub fallback: String,
    pub record: bool,

    pub publish_user: String,
    pub publish_pass: String,
    pub publish_ips: Vec<String>,
    pub read_user: String,
    pub read_pass: String,
    pub read_ips: Vec<String>,

    pub run_on_init: String,
    pub run_on_init_restart: bool,
    pub run_on_demand: String,
    pub run_on_demand_restart: bool,
    pub run_on_ready: String,
    pub run_on_read: String,
}

impl Default for PathConf {
    fn default() -> Self {
        PathConf {
            source: "publisher".to_owned(),
            source_on_demand: false,
            source_on_demand_start_timeout: Dur::from_secs(10),
            source_on_demand_close_after: Dur::from_secs(10),
            source_retry_pause: Dur::from_secs(5),
            disable_publisher_override: false,
            fallback: String::new(),
            record: false,
            publish_user: String::new(),
            publish_pass: String::new(),
            publish_ips: Vec::new(),
            read_user: String::new(),
            read_pass: String::new(),
            read_ips: Vec::new(),
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_ready: String::new(),
            run_on_read: String::new(),
        }
    }
}

impl PathConf {
    pub fn has_static_source(&self) -> bool {
        self.source != "publisher"
    }

    pub fn has_on_demand_publisher(&self) -> bool {
        !self.run_on_demand.is_empty()
    }

    /// True when a reader arriving on a not-ready path can trigger a source.
    pub fn can_start_on_demand(&self) -> bool {
        (self.has_static_source() && self.source_on_demand) || self.has_on_demand_publisher()
    }
}

/// Fields that may change on a live path without recreating it.
///
/// The whitelist is data: review it on any PathConf addition.
pub const HOT_RELOADABLE_PATH_FIELDS: &[&str] =
    &["record", "fallback", "runOnReady", "runOnRead"];

/// True when `old` → `new` touches only hot-reloadable fields.
pub fn path_conf_can_be_hot_updated(old: &PathConf, new: &PathConf) -> bool {
    let old_v = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_v = serde_json::to_value(new).unwrap_or(Value::Null);
    let (Value::Object(old_m), Value::Object(new_m)) = (old_v, new_v) else {
        return false;
    };
    for (key, old_val) in &old_m {
        if new_m.get(key) != Some(old_val) && !HOT_RELOADABLE_PATH_FIELDS.contains(&key.as_str()) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Path name grammar
// ---------------------------------------------------------------------------

/// Validate a runtime path name: non-empty, URL-safe, no leading or trailing
/// slash, no empty segment.
pub fn is_valid_path_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    if name.contains("//") {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '~' | '/'))
}

fn is_catch_all(conf_name: &str) -> bool {
    conf_name == "all" || conf_name == "all_others"
}

fn validate_conf_name(conf_name: &str) -> Result<(), ConfError> {
    if conf_name.is_empty() {
        return Err(ConfError::Invalid("path configuration name is empty".to_owned()));
    }
    if is_catch_all(conf_name) {
        return Ok(());
    }
    if let Some(pattern) = conf_name.strip_prefix('~') {
        regex::Regex::new(pattern).map_err(|e| {
            ConfError::Invalid(format!("invalid regex in path configuration '{conf_name}': {e}"))
        })?;
        return Ok(());
    }
    if !is_valid_path_name(conf_name) {
        return Err(ConfError::Invalid(format!(
            "invalid path configuration name '{conf_name}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Conf
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Conf {
    pub global: GlobalConf,
    pub path_defaults: PathConf,
    /// Effective per-path configurations, defaults merged in.
    pub paths: BTreeMap<String, PathConf>,
    /// Raw override values as written, keyed like `paths`.
    path_values: BTreeMap<String, Value>,
    path_defaults_value: Value,
}

impl PartialEq for Conf {
    fn eq(&self, other: &Self) -> bool {
        // raw override values are derivation inputs; equality is on outcomes
        self.global == other.global
            && self.path_defaults == other.path_defaults
            && self.paths == other.paths
    }
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            global: GlobalConf::default(),
            path_defaults: PathConf::default(),
            paths: BTreeMap::new(),
            path_values: BTreeMap::new(),
            path_defaults_value: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Shallow-merge `patch`'s top-level keys into `base`.
fn merge_values(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(b), Value::Object(p)) => {
            let mut out = b.clone();
            for (k, v) in p {
                if v.is_null() {
                    out.remove(k);
                } else {
                    out.insert(k.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        (_, p) => p.clone(),
    }
}

impl Conf {
    pub fn load(path: &Path) -> Result<Conf, ConfError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfError::Io(path.display().to_string(), e))?;
        Conf::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Conf, ConfError> {
        let yaml: serde_yaml::Value = if text.trim().is_empty() {
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        } else {
            serde_yaml::from_str(text).map_err(|e| ConfError::Parse(e.to_string()))?
        };
        let mut doc: Value =
            serde_json::to_value(&yaml).map_err(|e| ConfError::Parse(e.to_string()))?;
        if doc.is_null() {
            doc = Value::Object(serde_json::Map::new());
        }
        let Value::Object(ref mut map) = doc else {
            return Err(ConfError::Parse("top level must be a mapping".to_owned()));
        };

        let path_defaults_value = match map.remove("pathDefaults") {
            Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
            Some(v) => v,
        };
        let raw_paths = match map.remove("paths") {
            Some(Value::Null) | None => serde_json::Map::new(),
            Some(Value::Object(m)) => m,
            Some(_) => return Err(ConfError::Parse("'paths' must be a mapping".to_owned())),
        };

        let global: GlobalConf =
            serde_json::from_value(doc).map_err(|e| ConfError::Parse(e.to_string()))?;

        let mut path_values = BTreeMap::new();
        for (name, value) in raw_paths {
            let value = if value.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                value
            };
            path_values.insert(name, value);
        }

        let mut conf = Conf {
            global,
            path_defaults: PathConf::default(),
            paths: BTreeMap::new(),
            path_values,
            path_defaults_value,
        };
        conf.rebuild_paths()?;
        conf.validate()?;
        Ok(conf)
    }

    /// Re-derive `path_defaults` and every effective path conf from the raw
    /// override values.
    fn rebuild_paths(&mut self) -> Result<(), ConfError> {
        let defaults_v = merge_values(
            &serde_json::to_value(PathConf::default()).expect("PathConf serializes"),
            &self.path_defaults_value,
        );
        self.path_defaults = serde_json::from_value(defaults_v.clone())
            .map_err(|e| ConfError::Invalid(format!("pathDefaults: {e}")))?;

        let mut paths = BTreeMap::new();
        for (name, raw) in &self.path_values {
            let merged = merge_values(&defaults_v, raw);
            let conf: PathConf = serde_json::from_value(merged)
                .map_err(|e| ConfError::Invalid(format!("path '{name}': {e}")))?;
            paths.insert(name.clone(), conf);
        }
        self.paths = paths;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfError> {
        match self.global.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfError::Invalid(format!("invalid logLevel '{other}'")));
            }
        }
        if self.global.write_queue_size == 0 || !self.global.write_queue_size.is_power_of_two() {
            return Err(ConfError::Invalid(
                "writeQueueSize must be a power of two".to_owned(),
            ));
        }
        if (!self.global.rtsps_address.is_empty() || !self.global.rtmps_address.is_empty())
            && !self.global.tls_configured()
        {
            return Err(ConfError::Invalid(
                "serverKey and serverCert are required by the TLS listeners".to_owned(),
            ));
        }
        if self.global.hls_segment_count == 0 {
            return Err(ConfError::Invalid(
                "hlsSegmentCount must be at least 1".to_owned(),
            ));
        }

        let mut catch_alls = 0usize;
        for (name, conf) in &self.paths {
            validate_conf_name(name)?;
            if is_catch_all(name) {
                catch_alls += 1;
            }
            validate_path_conf(name, conf)?;
        }
        if catch_alls > 1 {
            return Err(ConfError::Invalid(
                "'all' and 'all_others' are aliases, configure at most one".to_owned(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // clone + patch operations (each returns a new validated Conf)
    // -----------------------------------------------------------------------

    pub fn patch_global(&self, patch: &Value) -> Result<Conf, ConfError> {
        let merged = merge_values(
            &serde_json::to_value(&self.global).expect("GlobalConf serializes"),
            patch,
        );
        let global: GlobalConf =
            serde_json::from_value(merged).map_err(|e| ConfError::Invalid(e.to_string()))?;
        let mut out = self.clone();
        out.global = global;
        out.validate()?;
        Ok(out)
    }

    pub fn patch_path_defaults(&self, patch: &Value) -> Result<Conf, ConfError> {
        let mut out = self.clone();
        out.path_defaults_value = merge_values(&out.path_defaults_value, patch);
        out.rebuild_paths()?;
        out.validate()?;
        Ok(out)
    }

    pub fn add_path(&self, name: &str, value: Value) -> Result<Conf, ConfError> {
        if self.path_values.contains_key(name) {
            return Err(ConfError::Invalid(format!(
                "path configuration '{name}' already exists"
            )));
        }
        self.set_path(name, value)
    }

    pub fn replace_path(&self, name: &str, value: Value) -> Result<Conf, ConfError> {
        if !self.path_values.contains_key(name) {
            return Err(ConfError::Invalid(format!(
                "path configuration '{name}' does not exist"
            )));
        }
        self.set_path(name, value)
    }

    pub fn patch_path(&self, name: &str, patch: &Value) -> Result<Conf, ConfError> {
        let current = self.path_values.get(name).ok_or_else(|| {
            ConfError::Invalid(format!("path configuration '{name}' does not exist"))
        })?;
        self.set_path(name, merge_values(current, patch))
    }

    pub fn delete_path(&self, name: &str) -> Result<Conf, ConfError> {
        if !self.path_values.contains_key(name) {
            return Err(ConfError::Invalid(format!(
                "path configuration '{name}' does not exist"
            )));
        }
        let mut out = self.clone();
        out.path_values.remove(name);
        out.rebuild_paths()?;
        out.validate()?;
        Ok(out)
    }

    fn set_path(&self, name: &str, value: Value) -> Result<Conf, ConfError> {
        validate_conf_name(name)?;
        let mut out = self.clone();
        out.path_values.insert(name.to_owned(), value);
        out.rebuild_paths()?;
        out.validate()?;
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Path discovery
    // -----------------------------------------------------------------------

    /// Resolve a requested path name to its configuration.
    ///
    /// Exact match first; then `~` regexes in sorted key order (first match
    /// wins, submatches captured); then the catch-all. The scan order is
    /// deterministic: same config + same name → same result.
    pub fn find_path_conf(&self, name: &str) -> Option<(String, PathConf, Vec<String>)> {
        if !name.starts_with('~') && !is_catch_all(name) {
            if let Some(conf) = self.paths.get(name) {
                return Some((name.to_owned(), conf.clone(), Vec::new()));
            }
        }

        for (conf_name, conf) in &self.paths {
            let Some(pattern) = conf_name.strip_prefix('~') else {
                continue;
            };
            // validated at load time
            let Ok(re) = regex::Regex::new(pattern) else {
                continue;
            };
            if let Some(caps) = re.captures(name) {
                let matches = caps
                    .iter()
                    .map(|c| c.map(|m| m.as_str().to_owned()).unwrap_or_default())
                    .collect();
                return Some((conf_name.clone(), conf.clone(), matches));
            }
        }

        for catch_all in ["all_others", "all"] {
            if let Some(conf) = self.paths.get(catch_all) {
                return Some((
                    catch_all.to_owned(),
                    conf.clone(),
                    vec![name.to_owned()],
                ));
            }
        }
        None
    }
}

fn validate_path_conf(name: &str, conf: &PathConf) -> Result<(), ConfError> {
    match conf.source.as_str() {
        "publisher" => {}
        s if s.starts_with("rtsp://") || s.starts_with("rtsps://") => {
            if name.starts_with('~') && !conf.source_on_demand {
                return Err(ConfError::Invalid(format!(
                    "path '{name}': a regex path with a static source requires sourceOnDemand"
                )));
            }
        }
        other => {
            return Err(ConfError::Invalid(format!(
                "path '{name}': unsupported source '{other}'"
            )));
        }
    }
    for (user, pass, what) in [
        (&conf.publish_user, &conf.publish_pass, "publish"),
        (&conf.read_user, &conf.read_pass, "read"),
    ] {
        if user.is_empty() != pass.is_empty() {
            return Err(ConfError::Invalid(format!(
                "path '{name}': {what} credentials require both user and pass"
            )));
        }
        if let Some(encoded) = pass.strip_prefix("sha256:") {
            use base64::Engine as _;
            if base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .is_err()
            {
                return Err(ConfError::Invalid(format!(
                    "path '{name}': invalid sha256 {what} credential"
                )));
            }
        }
    }
    for ip in conf.publish_ips.iter().chain(conf.read_ips.iter()) {
        crate::auth::parse_cidr(ip).map_err(|e| {
            ConfError::Invalid(format!("path '{name}': invalid IP '{ip}': {e}"))
        })?;
    }
    if !conf.fallback.is_empty()
        && !conf.fallback.starts_with("rtsp://")
        && !is_valid_path_name(&conf.fallback)
    {
        return Err(ConfError::Invalid(format!(
            "path '{name}': invalid fallback '{}'",
            conf.fallback
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let conf = Conf::parse("").unwrap();
        assert_eq!(conf.global.rtsp_address, ":8554");
        assert!(conf.paths.is_empty());
    }

    #[test]
    fn null_path_entry_gets_defaults() {
        let conf = Conf::parse("paths:\n  all_others:\n").unwrap();
        assert_eq!(conf.paths["all_others"], PathConf::default());
    }

    #[test]
    fn unknown_global_field_is_rejected() {
        assert!(Conf::parse("noSuchKnob: true\n").is_err());
    }

    #[test]
    fn path_defaults_flow_into_paths() {
        let conf = Conf::parse(
            "pathDefaults:\n  record: true\npaths:\n  cam1:\n  cam2:\n    record: false\n",
        )
        .unwrap();
        assert!(conf.paths["cam1"].record);
        assert!(!conf.paths["cam2"].record);
    }

    #[test]
    fn patching_defaults_rederives_paths() {
        let conf = Conf::parse("paths:\n  cam1:\n").unwrap();
        let patched = conf
            .patch_path_defaults(&serde_json::json!({"record": true}))
            .unwrap();
        assert!(patched.paths["cam1"].record);
        // the original is untouched
        assert!(!conf.paths["cam1"].record);
    }

    #[test]
    fn write_queue_size_must_be_power_of_two() {
        assert!(Conf::parse("writeQueueSize: 500\n").is_err());
        assert!(Conf::parse("writeQueueSize: 512\n").is_ok());
    }

    #[test]
    fn regex_conf_requires_valid_pattern() {
        assert!(Conf::parse("paths:\n  '~[':\n").is_err());
        assert!(Conf::parse("paths:\n  '~^cam_.*$':\n").is_ok());
    }

    #[test]
    fn find_prefers_exact_then_regex_then_catch_all() {
        let conf = Conf::parse(
            "paths:\n  mypath:\n    record: true\n  '~^cam_(.*)$':\n  all_others:\n",
        )
        .unwrap();

        let (name, pc, _) = conf.find_path_conf("mypath").unwrap();
        assert_eq!(name, "mypath");
        assert!(pc.record);

        let (name, _, matches) = conf.find_path_conf("cam_garden").unwrap();
        assert_eq!(name, "~^cam_(.*)$");
        assert_eq!(matches, vec!["cam_garden".to_owned(), "garden".to_owned()]);

        let (name, _, _) = conf.find_path_conf("anything/else").unwrap();
        assert_eq!(name, "all_others");
    }

    #[test]
    fn find_is_deterministic_across_overlapping_regexes() {
        let conf =
            Conf::parse("paths:\n  '~^a.*$':\n    record: true\n  '~^ab.*$':\n").unwrap();
        for _ in 0..10 {
            let (name, _, _) = conf.find_path_conf("abc").unwrap();
            // sorted key order: '~^a.*$' < '~^ab.*$'
            assert_eq!(name, "~^a.*$");
        }
    }

    #[test]
    fn no_conf_found_for_unconfigured_path() {
        let conf = Conf::parse("paths:\n  only:\n").unwrap();
        assert!(conf.find_path_conf("other").is_none());
    }

    #[test]
    fn add_patch_delete_path_roundtrip() {
        let conf = Conf::parse("paths:\n  all_others:\n").unwrap();
        let added = conf
            .add_path("stream1", serde_json::json!({"record": true}))
            .unwrap();
        assert!(added.paths["stream1"].record);
        assert!(added.add_path("stream1", serde_json::json!({})).is_err());

        let patched = added
            .patch_path("stream1", &serde_json::json!({"disablePublisherOverride": true}))
            .unwrap();
        assert!(patched.paths["stream1"].record);
        assert!(patched.paths["stream1"].disable_publisher_override);

        let deleted = patched.delete_path("stream1").unwrap();
        assert!(!deleted.paths.contains_key("stream1"));
        assert!(deleted.delete_path("stream1").is_err());
    }

    #[test]
    fn reload_equality_ignores_raw_representation() {
        let a = Conf::parse("paths:\n  cam1:\n    record: false\n").unwrap();
        let b = Conf::parse("paths:\n  cam1:\n").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hot_update_whitelist_is_honored() {
        let old = PathConf::default();
        let mut hot = old.clone();
        hot.record = true;
        hot.run_on_read = "echo reader".to_owned();
        assert!(path_conf_can_be_hot_updated(&old, &hot));

        let mut cold = old.clone();
        cold.disable_publisher_override = true;
        assert!(!path_conf_can_be_hot_updated(&old, &cold));
    }

    #[test]
    fn credentials_validation() {
        assert!(Conf::parse("paths:\n  p:\n    publishUser: admin\n").is_err());
        assert!(
            Conf::parse("paths:\n  p:\n    publishUser: admin\n    publishPass: secret\n").is_ok()
        );
        assert!(
            Conf::parse("paths:\n  p:\n    readUser: u\n    readPass: 'sha256:!!!'\n").is_err()
        );
    }

    #[test]
    fn listen_addr_normalization() {
        assert_eq!(normalize_listen_addr(":8554"), "0.0.0.0:8554");
        assert_eq!(normalize_listen_addr("127.0.0.1:8554"), "127.0.0.1:8554");
    }

    #[test]
    fn path_name_grammar() {
        assert!(is_valid_path_name("mypath"));
        assert!(is_valid_path_name("a/b/c"));
        assert!(!is_valid_path_name(""));
        assert!(!is_valid_path_name("/lead"));
        assert!(!is_valid_path_name("trail/"));
        assert!(!is_valid_path_name("sp ace"));
        assert!(!is_valid_path_name("a//b"));
    }
}
