use anyhow::Result;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;

use super::connector::*;

fn secret(pairs: &[(&str, &str)]) -> Secret {
    Secret {
        data: Some(
            pairs
                .iter()
                .map(|(key, val)| (key.to_string(), ByteString(val.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn fe_config_map(conf: &str) -> ConfigMap {
    ConfigMap {
        data: Some(maplit::btreemap! {"fe.conf".into() => conf.into()}),
        ..Default::default()
    }
}

#[test]
fn credentials_are_read_from_secret() -> Result<()> {
    let creds = credentials_from_secret(&secret(&[("username", "admin"), ("password", "s3cret\n")]));
    assert_eq!(creds.username, "admin", "expected username from secret");
    assert_eq!(creds.password, "s3cret", "expected trailing newline to be trimmed from password");
    Ok(())
}

#[test]
fn credentials_fall_back_to_defaults() -> Result<()> {
    let creds = credentials_from_secret(&secret(&[]));
    assert_eq!(creds, default_credentials(), "expected default credentials for an empty secret");
    assert_eq!(creds.username, "root");
    assert_eq!(creds.password, "");

    let creds = credentials_from_secret(&Secret::default());
    assert_eq!(creds, default_credentials(), "expected default credentials for a secret without data");
    Ok(())
}

#[test]
fn query_port_is_parsed_from_fe_conf() -> Result<()> {
    let conf = "# query_port = 1111\nhttp_port = 8030\n  query_port = 9130  \nrpc_port=9020\n";
    assert_eq!(query_port_from_conf(conf), Some(9130));
    assert_eq!(query_port_from_conf("query_port=9131"), Some(9131));
    Ok(())
}

#[test]
fn query_port_ignores_comments_and_garbage() -> Result<()> {
    assert_eq!(query_port_from_conf("#query_port=1111"), None);
    assert_eq!(query_port_from_conf("query_port = abc"), None);
    assert_eq!(query_port_from_conf("query_port_extra = 1234"), None);
    assert_eq!(query_port_from_conf(""), None);
    Ok(())
}

#[test]
fn query_port_defaults_when_unconfigured() -> Result<()> {
    assert_eq!(query_port_from_config_maps(&[]), DEFAULT_QUERY_PORT);
    assert_eq!(query_port_from_config_maps(&[ConfigMap::default()]), DEFAULT_QUERY_PORT);
    assert_eq!(query_port_from_config_maps(&[fe_config_map("http_port = 8030")]), DEFAULT_QUERY_PORT);
    Ok(())
}

#[test]
fn query_port_first_config_map_wins() -> Result<()> {
    let cms = vec![
        ConfigMap::default(),
        fe_config_map("http_port = 8030"),
        fe_config_map("query_port = 9230"),
        fe_config_map("query_port = 9330"),
    ];
    assert_eq!(query_port_from_config_maps(&cms), 9230);
    Ok(())
}
