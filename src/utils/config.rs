//! Configuraiton parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(CopilotError)` on parser failure.
///
/// Example:
/// ```no_run
/// # use copilot::{parsed_config, CopilotError};
/// # #[derive(Default)]
/// # struct MyConfig { settle_ms: u64, client_id: u64 }
/// # fn main() -> Result<(), CopilotError> {
/// # let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => MyConfig; settle_ms, client_id)?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::CopilotError> {
            let mut config: $config_type = Default::default();
            let config_str = match config_str {
                Some(s) => s,
                None => return Ok(config),
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::CopilotError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
