//! Parser for the `KEY=VALUE` output of `singularity buildcfg`.

use getset::Getters;
use std::{
    io::{BufRead, BufReader, Read},
    path::PathBuf,
};

const KEY_CONFDIR: &str = "SINGULARITY_CONFDIR";

#[derive(Clone, Debug, Default, Eq, Getters, PartialEq)]
/// Compile time configuration of the installed runtime binary.
pub struct BuildConfig {
    /// Directory holding the runtime's configuration files.
    #[get = "pub"]
    singularity_confdir: PathBuf,
}

impl BuildConfig {
    /// Parse `buildcfg` output; unknown keys are ignored, missing keys keep
    /// their zero value.
    pub fn from_reader<R: Read>(reader: R) -> std::io::Result<Self> {
        let mut config = Self::default();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let mut parts = line.splitn(2, '=');
            let key = match parts.next() {
                Some(key) => key.trim(),
                None => continue,
            };
            let value = match parts.next() {
                Some(value) => value.trim(),
                None => continue,
            };
            if key == KEY_CONFDIR {
                config.singularity_confdir = PathBuf::from(value);
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_confdir() {
        let output = "\
PACKAGE_NAME=singularity
SINGULARITY_CONFDIR=/usr/local/etc/singularity
SINGULARITY_SUID_INSTALL=1
";
        let config = BuildConfig::from_reader(output.as_bytes()).expect("parse");
        assert_eq!(
            config.singularity_confdir(),
            &PathBuf::from("/usr/local/etc/singularity")
        );
    }

    #[test]
    fn missing_key_yields_zero_value() {
        let output = "PACKAGE_NAME=singularity\nMALFORMED LINE\n";
        let config = BuildConfig::from_reader(output.as_bytes()).expect("parse");
        assert_eq!(config, BuildConfig::default());
    }
}
