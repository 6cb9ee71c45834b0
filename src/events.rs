use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail};

use crate::cache::ImagePair;
use crate::descriptor::Descriptor;

/// Playback control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    Play,
    Stop,
    Next,
    Previous,
    Rewind,
    SetFrame(u32),
    /// Re-request the current configuration.
    Redraw,
}

impl FromStr for PlayerCommand {
    type Err = anyhow::Error;

    /// Parses control words as typed on stdin, e.g. `play` or `frame 12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let cmd = match words.next().map(str::to_ascii_lowercase).as_deref() {
            Some("play") => Self::Play,
            Some("stop") => Self::Stop,
            Some("next") => Self::Next,
            Some("previous" | "prev") => Self::Previous,
            Some("rewind") => Self::Rewind,
            Some("redraw") => Self::Redraw,
            Some("frame") => {
                let raw = words.next().ok_or_else(|| anyhow!("frame needs a number"))?;
                Self::SetFrame(raw.parse().map_err(|_| anyhow!("invalid frame {raw:?}"))?)
            }
            Some(other) => bail!("unknown command {other:?}"),
            None => bail!("empty command"),
        };
        if words.next().is_some() {
            bail!("trailing input in {s:?}");
        }
        Ok(cmd)
    }
}

impl fmt::Display for PlayerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Play => f.write_str("play"),
            Self::Stop => f.write_str("stop"),
            Self::Next => f.write_str("next"),
            Self::Previous => f.write_str("previous"),
            Self::Rewind => f.write_str("rewind"),
            Self::SetFrame(n) => write!(f, "frame {n}"),
            Self::Redraw => f.write_str("redraw"),
        }
    }
}

/// Pairs no slot references anymore; the presenter releases their textures.
#[derive(Debug)]
pub struct Evicted(pub Vec<Arc<ImagePair>>);

/// Variable files were written on disk; `added` counts frames that are new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramesChanged {
    pub added: usize,
}

/// The presenter switched a slot to a new pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presented {
    pub slot: usize,
    /// `None` when the slot shows the placeholder.
    pub descriptor: Option<Descriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_control_words() {
        assert_eq!("play".parse::<PlayerCommand>().unwrap(), PlayerCommand::Play);
        assert_eq!(" PREV ".parse::<PlayerCommand>().unwrap(), PlayerCommand::Previous);
        assert_eq!(
            "frame 12".parse::<PlayerCommand>().unwrap(),
            PlayerCommand::SetFrame(12)
        );
        assert!("frame".parse::<PlayerCommand>().is_err());
        assert!("frame x".parse::<PlayerCommand>().is_err());
        assert!("jump".parse::<PlayerCommand>().is_err());
        assert!("play now".parse::<PlayerCommand>().is_err());
    }

    #[test]
    fn display_parses_back() {
        for cmd in [PlayerCommand::Stop, PlayerCommand::SetFrame(3), PlayerCommand::Redraw] {
            assert_eq!(cmd.to_string().parse::<PlayerCommand>().unwrap(), cmd);
        }
    }
}
