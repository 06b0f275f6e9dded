//! Request timeout tiers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How patient the client is with its servers, e.g. relaxed over slow links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutLevel {
    #[default]
    Normal,
    Relaxed,
    MostRelaxed,
}

/// Class of request a timeout applies to.
///
/// `Urgent` covers header fetches made while the chain lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTimeout {
    Generic,
    Urgent,
}

impl NetworkTimeout {
    pub fn duration(self, level: TimeoutLevel) -> Duration {
        let secs = match (self, level) {
            (NetworkTimeout::Generic, TimeoutLevel::Normal) => 30,
            (NetworkTimeout::Generic, TimeoutLevel::Relaxed) => 45,
            (NetworkTimeout::Generic, TimeoutLevel::MostRelaxed) => 180,
            (NetworkTimeout::Urgent, TimeoutLevel::Normal) => 10,
            (NetworkTimeout::Urgent, TimeoutLevel::Relaxed) => 20,
            (NetworkTimeout::Urgent, TimeoutLevel::MostRelaxed) => 60,
        };
        Duration::from_secs(secs)
    }
}

impl FromStr for TimeoutLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(TimeoutLevel::Normal),
            "relaxed" => Ok(TimeoutLevel::Relaxed),
            "most-relaxed" | "most_relaxed" | "mostrelaxed" => Ok(TimeoutLevel::MostRelaxed),
            other => Err(format!("unknown timeout level: {}", other)),
        }
    }
}

impl fmt::Display for TimeoutLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutLevel::Normal => "normal",
            TimeoutLevel::Relaxed => "relaxed",
            TimeoutLevel::MostRelaxed => "most-relaxed",
        };
        f.write_str(name)
    }
}

/// Both timeout classes resolved for one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub generic: Duration,
    pub urgent: Duration,
}

impl Timeouts {
    pub fn for_level(level: TimeoutLevel) -> Self {
        Self {
            generic: NetworkTimeout::Generic.duration(level),
            urgent: NetworkTimeout::Urgent.duration(level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers() {
        assert_eq!(Timeouts::for_level(TimeoutLevel::Normal).generic, Duration::from_secs(30));
        assert_eq!(Timeouts::for_level(TimeoutLevel::Normal).urgent, Duration::from_secs(10));
        assert_eq!(Timeouts::for_level(TimeoutLevel::Relaxed).urgent, Duration::from_secs(20));
        assert_eq!(Timeouts::for_level(TimeoutLevel::MostRelaxed).generic, Duration::from_secs(180));
    }

    #[test]
    fn test_level_parse_round_trip() {
        for level in [TimeoutLevel::Normal, TimeoutLevel::Relaxed, TimeoutLevel::MostRelaxed] {
            assert_eq!(level.to_string().parse::<TimeoutLevel>().unwrap(), level);
        }
        assert!("sluggish".parse::<TimeoutLevel>().is_err());
    }
}
