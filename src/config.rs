use std::path::Path;
use std::str::FromStr;
use std::{env, fs};

use thiserror::Error;

use crate::api_client::AccountCredentials;

/// Template written when no .env exists, so a first run produces something
/// editable instead of a bare error.
const ENV_TEMPLATE: &str = r#"ENV_PLACE_USERNAME='["developer_username"]'
ENV_PLACE_PASSWORD='["developer_password"]'
ENV_PLACE_APP_CLIENT_ID='["app_client_id"]'
ENV_PLACE_SECRET_KEY='["app_secret_key"]'
ENV_DRAW_X_START="x_position_start_integer"
ENV_DRAW_Y_START="y_position_start_integer"
ENV_R_START='["0"]'
ENV_C_START='["0"]'
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVar(&'static str),
    #[error("invalid value for {var} - {reason}")]
    InvalidVar { var: &'static str, reason: String },
    #[error("account #{index}: no entry in {var} (all credential and cursor arrays must have one item per account)")]
    MissingAccountEntry { var: &'static str, index: usize },
}

/// Everything one worker needs to start: its credentials and the resume
/// cursor seeded from the per-account arrays.
#[derive(Debug, Clone)]
pub struct AccountSetup {
    pub credentials: AccountCredentials,
    pub cursor: (u32, u32),
}

#[derive(Debug, Clone)]
pub struct Config {
    usernames: Vec<String>,
    passwords: Vec<String>,
    client_ids: Vec<String>,
    client_secrets: Vec<String>,
    row_starts: Vec<String>,
    col_starts: Vec<String>,
    pub draw_origin: (u32, u32),
    pub launch_delay_secs: u64,
    pub staleness_secs: u64,
    pub poll_secs: u64,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    pub auth_base_url: Option<String>,
    pub gql_base_url: Option<String>,
    pub canvas_ws_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Config {
            usernames: env_json_array("ENV_PLACE_USERNAME")?,
            passwords: env_json_array("ENV_PLACE_PASSWORD")?,
            client_ids: env_json_array("ENV_PLACE_APP_CLIENT_ID")?,
            client_secrets: env_json_array("ENV_PLACE_SECRET_KEY")?,
            row_starts: env_json_array("ENV_R_START")?,
            col_starts: env_json_array("ENV_C_START")?,
            draw_origin: (
                env_parse_required("ENV_DRAW_X_START")?,
                env_parse_required("ENV_DRAW_Y_START")?,
            ),
            launch_delay_secs: env_or_parse("ENV_THREAD_DELAY", 3)?,
            staleness_secs: env_or_parse("ENV_QUEUE_STALENESS_SECS", 5)?,
            poll_secs: env_or_parse("ENV_COOLDOWN_POLL_SECS", 10)?,
            backoff_min_secs: env_or_parse("ENV_BACKOFF_MIN_SECS", 5)?,
            backoff_max_secs: env_or_parse("ENV_BACKOFF_MAX_SECS", 30)?,
            auth_base_url: env::var("ENV_AUTH_BASE_URL").ok(),
            gql_base_url: env::var("ENV_GQL_BASE_URL").ok(),
            canvas_ws_url: env::var("ENV_CANVAS_WS_URL").ok(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.usernames.is_empty() {
            return Err(ConfigError::InvalidVar {
                var: "ENV_PLACE_USERNAME",
                reason: "at least one account is required".to_string(),
            });
        }
        if self.backoff_min_secs > self.backoff_max_secs {
            return Err(ConfigError::InvalidVar {
                var: "ENV_BACKOFF_MIN_SECS",
                reason: "backoff minimum exceeds maximum".to_string(),
            });
        }
        Ok(())
    }

    /// Number of workers to launch, one per username entry.
    pub fn account_count(&self) -> usize {
        self.usernames.len()
    }

    /// Assemble the setup for one account index. A too-short companion
    /// array surfaces as an error naming the variable and index, so a
    /// single misconfigured account is reported without taking down the
    /// rest.
    pub fn account(&self, index: usize) -> Result<AccountSetup, ConfigError> {
        let credentials = AccountCredentials {
            username: array_entry(&self.usernames, "ENV_PLACE_USERNAME", index)?,
            password: array_entry(&self.passwords, "ENV_PLACE_PASSWORD", index)?,
            client_id: array_entry(&self.client_ids, "ENV_PLACE_APP_CLIENT_ID", index)?,
            client_secret: array_entry(&self.client_secrets, "ENV_PLACE_SECRET_KEY", index)?,
        };
        let cursor = (
            parse_entry(&self.row_starts, "ENV_R_START", index)?,
            parse_entry(&self.col_starts, "ENV_C_START", index)?,
        );
        Ok(AccountSetup {
            credentials,
            cursor,
        })
    }
}

/// Write the starter .env when none exists yet. Returns the template so the
/// caller can tell the user what was generated.
pub fn write_env_template(path: &Path) -> std::io::Result<()> {
    fs::write(path, ENV_TEMPLATE)
}

fn array_entry(
    values: &[String],
    var: &'static str,
    index: usize,
) -> Result<String, ConfigError> {
    values
        .get(index)
        .cloned()
        .ok_or(ConfigError::MissingAccountEntry { var, index })
}

fn parse_entry(values: &[String], var: &'static str, index: usize) -> Result<u32, ConfigError> {
    let raw = array_entry(values, var, index)?;
    raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
        var,
        reason: format!("entry #{index} is not an integer: {raw:?}"),
    })
}

/// The credential and cursor variables hold JSON string arrays, e.g.
/// ENV_R_START='["0","5"]'.
fn env_json_array(var: &'static str) -> Result<Vec<String>, ConfigError> {
    let raw = env::var(var).map_err(|_| ConfigError::MissingVar(var))?;
    serde_json::from_str(&raw).map_err(|err| ConfigError::InvalidVar {
        var,
        reason: format!("expected a JSON string array: {err}"),
    })
}

fn env_parse_required<T: FromStr>(var: &'static str) -> Result<T, ConfigError> {
    let raw = env::var(var).map_err(|_| ConfigError::MissingVar(var))?;
    raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
        var,
        reason: format!("could not parse {raw:?}"),
    })
}

fn env_or_parse<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
            var,
            reason: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_accounts(usernames: usize, cursors: usize) -> Config {
        Config {
            usernames: (0..usernames).map(|i| format!("user{i}")).collect(),
            passwords: (0..usernames).map(|i| format!("pass{i}")).collect(),
            client_ids: (0..usernames).map(|i| format!("id{i}")).collect(),
            client_secrets: (0..usernames).map(|i| format!("secret{i}")).collect(),
            row_starts: (0..cursors).map(|i| i.to_string()).collect(),
            col_starts: (0..cursors).map(|i| i.to_string()).collect(),
            draw_origin: (100, 200),
            launch_delay_secs: 3,
            staleness_secs: 5,
            poll_secs: 10,
            backoff_min_secs: 5,
            backoff_max_secs: 30,
            auth_base_url: None,
            gql_base_url: None,
            canvas_ws_url: None,
        }
    }

    #[test]
    fn account_assembles_credentials_and_cursor() {
        let config = config_with_accounts(2, 2);
        let setup = config.account(1).unwrap();
        assert_eq!(setup.credentials.username, "user1");
        assert_eq!(setup.credentials.client_secret, "secret1");
        assert_eq!(setup.cursor, (1, 1));
    }

    #[test]
    fn short_cursor_array_names_the_variable_and_index() {
        let config = config_with_accounts(3, 2);
        let err = config.account(2).unwrap_err();
        match err {
            ConfigError::MissingAccountEntry { var, index } => {
                assert_eq!(var, "ENV_R_START");
                assert_eq!(index, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Earlier accounts are unaffected.
        assert!(config.account(0).is_ok());
        assert!(config.account(1).is_ok());
    }

    #[test]
    fn non_numeric_cursor_entry_is_invalid() {
        let mut config = config_with_accounts(1, 1);
        config.row_starts[0] = "abc".to_string();
        assert!(matches!(
            config.account(0),
            Err(ConfigError::InvalidVar { var: "ENV_R_START", .. })
        ));
    }

    #[test]
    fn backoff_range_is_validated() {
        let mut config = config_with_accounts(1, 1);
        config.backoff_min_secs = 60;
        config.backoff_max_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_account_list_is_rejected() {
        let config = config_with_accounts(0, 0);
        assert!(config.validate().is_err());
    }
}
