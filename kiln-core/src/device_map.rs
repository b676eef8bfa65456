use std::{fmt, str::FromStr};

/// Where the model should run. `Ordinal` prefers the accelerator with that
/// index and falls back to the CPU when no accelerator backend is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::default()),
            "cpu" => Ok(Self::ForceCpu),
            other => other
                .trim_start_matches("gpu:")
                .trim_start_matches("cuda:")
                .trim_start_matches("metal:")
                .parse()
                .map(Self::Ordinal)
                .map_err(|_| {
                    format!("invalid device '{s}': expected 'auto', 'cpu' or an accelerator ordinal")
                }),
        }
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => f.write_str("cpu"),
            Self::Ordinal(ordinal) => write!(f, "accelerator:{ordinal}"),
        }
    }
}
