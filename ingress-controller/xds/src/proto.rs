//! Helpers shared by the Envoy resource translators.

use envoy_types::pb::{
    envoy::{
        config::core::v3::{
            config_source::ConfigSourceSpecifier, data_source::Specifier, AggregatedConfigSource,
            ApiVersion, ConfigSource, DataSource,
        },
        extensions::transport_sockets::tls::v3::SdsSecretConfig,
    },
    google::protobuf::{Any, Duration},
};
use ingress_controller_core::timeout::Timeout;
use prost::Message;

pub(crate) fn any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

pub(crate) fn duration(d: std::time::Duration) -> Duration {
    Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

/// Converts a timeout setting, where Envoy treats a zero duration as
/// disabled and an absent one as its default.
pub(crate) fn timeout(t: Timeout) -> Option<Duration> {
    match t {
        Timeout::Default => None,
        Timeout::Disabled => Some(Duration::default()),
        Timeout::Value(d) => Some(duration(d)),
    }
}

/// Resources are always fetched over the aggregated stream.
pub(crate) fn ads() -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource::default())),
        ..Default::default()
    }
}

pub(crate) fn sds(secret: &str) -> SdsSecretConfig {
    SdsSecretConfig {
        name: secret.to_string(),
        sds_config: Some(ads()),
    }
}

pub(crate) fn inline_bytes(bytes: &[u8]) -> DataSource {
    DataSource {
        specifier: Some(Specifier::InlineBytes(bytes.to_vec())),
        ..Default::default()
    }
}
