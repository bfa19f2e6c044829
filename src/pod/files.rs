//! Host files owned by a pod: resolv.conf and hostname.

use crate::pod::config::DnsConfig;
use anyhow::{Context, Result};
use std::{fs, path::Path};

/// Render and write the pod's resolv.conf.
///
/// Servers come first, one `nameserver` line each, then a single `search`
/// line when any search domain is set, then one `options` line per option.
pub fn write_resolv_conf(path: &Path, dns: &DnsConfig) -> Result<()> {
    fs::write(path, render_resolv_conf(dns))
        .with_context(|| format!("write resolv.conf {}", path.display()))
}

fn render_resolv_conf(dns: &DnsConfig) -> String {
    let mut content = String::new();
    for server in dns.servers() {
        content.push_str(&format!("nameserver {}\n", server));
    }
    if !dns.searches().is_empty() {
        content.push_str(&format!("search {}\n", dns.searches().join(" ")));
    }
    for option in dns.options() {
        content.push_str(&format!("options {}\n", option));
    }
    content
}

/// Write the pod's hostname file.
pub fn write_hostname(path: &Path, hostname: &str) -> Result<()> {
    fs::write(path, format!("{}\n", hostname))
        .with_context(|| format!("write hostname {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::config::DnsConfigBuilder;
    use tempfile::TempDir;

    #[test]
    fn resolv_conf_format() -> Result<()> {
        let dns = DnsConfigBuilder::default()
            .servers(vec!["10.0.0.12".to_string(), "192.168.1.1".to_string()])
            .searches(vec!["mongo.cluster.local".to_string(), "mongo".to_string()])
            .build()?;
        assert_eq!(
            render_resolv_conf(&dns),
            "nameserver 10.0.0.12\nnameserver 192.168.1.1\nsearch mongo.cluster.local mongo\n"
        );
        Ok(())
    }

    #[test]
    fn resolv_conf_options_and_empty_sections() -> Result<()> {
        let dns = DnsConfigBuilder::default()
            .servers(vec!["1.1.1.1".to_string()])
            .options(vec!["ndots:2".to_string(), "edns0".to_string()])
            .build()?;
        assert_eq!(
            render_resolv_conf(&dns),
            "nameserver 1.1.1.1\noptions ndots:2\noptions edns0\n"
        );
        assert_eq!(render_resolv_conf(&DnsConfig::default()), "");
        Ok(())
    }

    #[test]
    fn files_land_on_disk() -> Result<()> {
        let dir = TempDir::new()?;
        let resolv = dir.path().join("resolv.conf");
        let hostname = dir.path().join("hostname");

        write_resolv_conf(
            &resolv,
            &DnsConfigBuilder::default()
                .servers(vec!["8.8.8.8".to_string()])
                .build()?,
        )?;
        write_hostname(&hostname, "pod-1")?;

        assert_eq!(fs::read_to_string(resolv)?, "nameserver 8.8.8.8\n");
        assert_eq!(fs::read_to_string(hostname)?, "pod-1\n");
        Ok(())
    }
}
