use std::env;

// Initial window size constants
pub const INITIAL_WINDOW_WIDTH: u32 = 1920;
pub const INITIAL_WINDOW_HEIGHT: u32 = 1080;

/// Knobs the renderer reads once at creation.
#[derive(Clone, Debug, PartialEq)]
pub struct RendererConfig {
    pub application_name: String,
    /// Enables `VK_LAYER_KHRONOS_validation` and routes its messages to `log`.
    pub validation: bool,
    /// Prefer `MAILBOX` presentation; `FIFO` is always the fallback.
    pub prefer_mailbox: bool,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub initial_extent: (u32, u32),
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: "Ferris Scene VK".to_string(),
            validation: cfg!(debug_assertions),
            prefer_mailbox: true,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            initial_extent: (INITIAL_WINDOW_WIDTH, INITIAL_WINDOW_HEIGHT),
        }
    }
}

impl RendererConfig {
    /// Defaults overridden by `FERRIS_VALIDATION`, `FERRIS_PRESENT_MODE` and
    /// `FERRIS_CLEAR_COLOR`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply(|key| env::var(key).ok());
        config
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("FERRIS_VALIDATION") {
            match value.trim() {
                "1" | "true" | "on" => self.validation = true,
                "0" | "false" | "off" => self.validation = false,
                other => log::warn!("Ignoring FERRIS_VALIDATION=`{other}`"),
            }
        }

        if let Some(value) = lookup("FERRIS_PRESENT_MODE") {
            match value.trim().to_ascii_lowercase().as_str() {
                "mailbox" => self.prefer_mailbox = true,
                "fifo" => self.prefer_mailbox = false,
                other => log::warn!("Ignoring FERRIS_PRESENT_MODE=`{other}`"),
            }
        }

        if let Some(value) = lookup("FERRIS_CLEAR_COLOR") {
            match parse_color(&value) {
                Some(color) => self.clear_color = color,
                None => log::warn!("Ignoring FERRIS_CLEAR_COLOR=`{value}`"),
            }
        }
    }
}

fn parse_color(value: &str) -> Option<[f32; 4]> {
    let parts = value
        .split(',')
        .map(|p| p.trim().parse::<f32>().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [r, g, b, a] => Some([*r, *g, *b, *a]),
        [r, g, b] => Some([*r, *g, *b, 1.0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn configured(vars: &[(&str, &str)]) -> RendererConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = RendererConfig::default();
        config.apply(|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn defaults_clear_to_opaque_black() {
        let config = RendererConfig::default();
        assert_eq!(config.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.clear_depth, 1.0);
        assert!(config.prefer_mailbox);
    }

    #[test]
    fn environment_overrides_apply() {
        let config = configured(&[
            ("FERRIS_VALIDATION", "0"),
            ("FERRIS_PRESENT_MODE", "FIFO"),
            ("FERRIS_CLEAR_COLOR", "0.1, 0.2, 0.3"),
        ]);
        assert!(!config.validation);
        assert!(!config.prefer_mailbox);
        assert_eq!(config.clear_color, [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = configured(&[
            ("FERRIS_PRESENT_MODE", "immediate"),
            ("FERRIS_CLEAR_COLOR", "red"),
        ]);
        let defaults = RendererConfig::default();
        assert_eq!(config.prefer_mailbox, defaults.prefer_mailbox);
        assert_eq!(config.clear_color, defaults.clear_color);
    }
}
