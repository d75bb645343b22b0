//! Settings for the jinx template compiler.
//!
//! Sources are layered lowest priority first: the user config file, the
//! project's `.jinx.toml`, the project's `jinx.toml`, and finally the
//! `JINX_MACRO_DEBUGGING` environment variable.

use std::fmt;
use std::path::Path;

use config::Config;
use config::ConfigError as ExternalConfigError;
use config::File;
use config::FileFormat;
use directories::ProjectDirs;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use thiserror::Error;

pub const MACRO_DEBUGGING_ENV: &str = "JINX_MACRO_DEBUGGING";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration build/deserialize error")]
    Config(#[from] ExternalConfigError),
}

#[must_use]
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "jinx")
}

/// How compiled template listings are exposed for step-through debugging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MacroDebugging {
    #[default]
    Off,
    /// Keep listings in the in-process source store under an opaque name.
    Inject,
    /// Also write every listing to a temporary file.
    Write,
}

impl MacroDebugging {
    /// Lenient parse: empty, `0`, `false` and `off` disable; `write` writes; anything else injects.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "off" | "no" => Self::Off,
            "write" => Self::Write,
            _ => Self::Inject,
        }
    }

    #[must_use]
    pub fn is_enabled(self) -> bool {
        self != Self::Off
    }
}

impl<'de> Deserialize<'de> for MacroDebugging {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FlagVisitor;

        impl de::Visitor<'_> for FlagVisitor {
            type Value = MacroDebugging;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean, an integer, or one of \"off\", \"inject\", \"write\"")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(if v {
                    MacroDebugging::Inject
                } else {
                    MacroDebugging::Off
                })
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                self.visit_bool(v != 0)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                self.visit_bool(v != 0)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(MacroDebugging::parse(v))
            }
        }

        deserializer.deserialize_any(FlagVisitor)
    }
}

#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub macro_debugging: MacroDebugging,
}

impl Settings {
    pub fn new(project_root: &Path) -> Result<Self, ConfigError> {
        let user_config_file =
            project_dirs().map(|proj_dirs| proj_dirs.config_dir().join("jinx.toml"));
        let env_flag = std::env::var(MACRO_DEBUGGING_ENV).ok();

        Self::load_from_paths(project_root, user_config_file.as_deref(), env_flag)
    }

    fn load_from_paths(
        project_root: &Path,
        user_config_path: Option<&Path>,
        env_flag: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = user_config_path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        builder = builder.add_source(
            File::from(project_root.join(".jinx.toml"))
                .format(FileFormat::Toml)
                .required(false),
        );

        builder = builder.add_source(
            File::from(project_root.join("jinx.toml"))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(flag) = &env_flag {
            tracing::debug!("{} set in environment: {:?}", MACRO_DEBUGGING_ENV, flag);
        }
        builder = builder.set_override_option("macro_debugging", env_flag)?;

        let config = builder.build()?;
        let settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    mod defaults {
        use super::*;

        #[test]
        fn test_load_no_files() {
            let dir = tempdir().unwrap();
            let settings = Settings::load_from_paths(dir.path(), None, None).unwrap();
            assert_eq!(settings, Settings::default());
            assert_eq!(settings.macro_debugging, MacroDebugging::Off);
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn test_lenient_flag_values() {
            assert_eq!(MacroDebugging::parse(""), MacroDebugging::Off);
            assert_eq!(MacroDebugging::parse("0"), MacroDebugging::Off);
            assert_eq!(MacroDebugging::parse("False"), MacroDebugging::Off);
            assert_eq!(MacroDebugging::parse("write"), MacroDebugging::Write);
            assert_eq!(MacroDebugging::parse("WRITE"), MacroDebugging::Write);
            assert_eq!(MacroDebugging::parse("1"), MacroDebugging::Inject);
            assert_eq!(MacroDebugging::parse("yes please"), MacroDebugging::Inject);
        }
    }

    mod project_files {
        use super::*;

        #[test]
        fn test_load_jinx_toml_bool() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("jinx.toml"), "macro_debugging = true").unwrap();
            let settings = Settings::load_from_paths(dir.path(), None, None).unwrap();
            assert_eq!(settings.macro_debugging, MacroDebugging::Inject);
        }

        #[test]
        fn test_load_dot_jinx_toml_string() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join(".jinx.toml"), "macro_debugging = \"write\"").unwrap();
            let settings = Settings::load_from_paths(dir.path(), None, None).unwrap();
            assert_eq!(settings.macro_debugging, MacroDebugging::Write);
        }
    }

    mod priority {
        use super::*;

        #[test]
        fn test_jinx_overrides_dot_jinx() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join(".jinx.toml"), "macro_debugging = \"write\"").unwrap();
            fs::write(dir.path().join("jinx.toml"), "macro_debugging = false").unwrap();
            let settings = Settings::load_from_paths(dir.path(), None, None).unwrap();
            assert_eq!(settings.macro_debugging, MacroDebugging::Off);
        }

        #[test]
        fn test_project_overrides_user() {
            let user_dir = tempdir().unwrap();
            let project_dir = tempdir().unwrap();
            let user_conf_path = user_dir.path().join("jinx.toml");
            fs::write(&user_conf_path, "macro_debugging = true").unwrap();
            fs::write(project_dir.path().join("jinx.toml"), "macro_debugging = false").unwrap();

            let settings =
                Settings::load_from_paths(project_dir.path(), Some(&user_conf_path), None).unwrap();
            assert_eq!(settings.macro_debugging, MacroDebugging::Off);
        }

        #[test]
        fn test_env_overrides_files() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("jinx.toml"), "macro_debugging = false").unwrap();
            let settings =
                Settings::load_from_paths(dir.path(), None, Some("write".to_string())).unwrap();
            assert_eq!(settings.macro_debugging, MacroDebugging::Write);
        }
    }

    mod user_config {
        use super::*;

        #[test]
        fn test_load_user_config_only() {
            let user_dir = tempdir().unwrap();
            let project_dir = tempdir().unwrap();
            let user_conf_path = user_dir.path().join("jinx.toml");
            fs::write(&user_conf_path, "macro_debugging = 1").unwrap();

            let settings =
                Settings::load_from_paths(project_dir.path(), Some(&user_conf_path), None).unwrap();
            assert_eq!(settings.macro_debugging, MacroDebugging::Inject);
        }

        #[test]
        fn test_missing_user_config_is_ignored() {
            let user_dir = tempdir().unwrap();
            let project_dir = tempdir().unwrap();
            let user_conf_path = user_dir.path().join("jinx.toml");

            let settings =
                Settings::load_from_paths(project_dir.path(), Some(&user_conf_path), None).unwrap();
            assert_eq!(settings, Settings::default());
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn test_invalid_toml_content() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("jinx.toml"), "macro_debugging = [1, 2").unwrap();
            let result = Settings::load_from_paths(dir.path(), None, None);
            assert!(matches!(result.unwrap_err(), ConfigError::Config(_)));
        }
    }
}
