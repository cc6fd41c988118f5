//! Input events projected from measurement results.
//!
//! Each result becomes one absolute event keyed by channel, with sub-capture,
//! confidence and distance packed into the value:
//!
//! ```text
//!  31      24 23      16 15                0
//! +----------+----------+-------------------+
//! | subcap   | conf     | distance_mm       |
//! +----------+----------+-------------------+
//! ```
//!
//! A [`InputEvent::Sync`] closes every measurement cycle.

use tokio::sync::broadcast;

use crate::message::{MeasResult, Message};

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Abs { code: u16, value: u32 },
    Sync,
}

impl InputEvent {
    pub fn from_result(result: &MeasResult) -> Self {
        InputEvent::Abs {
            code: result.channel as u16,
            value: (result.sub_capture as u32) << 24 | (result.confidence as u32) << 16 | result.distance_mm as u32,
        }
    }
}

/// Events for `message`; only measurement results publish anything.
pub fn events_for(message: &Message) -> Vec<InputEvent> {
    match message {
        Message::MeasResults(meas) => meas
            .results
            .iter()
            .map(InputEvent::from_result)
            .chain(std::iter::once(InputEvent::Sync))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn publish_events(sender: &broadcast::Sender<InputEvent>, message: &Message) {
    if sender.receiver_count() == 0 {
        return;
    }
    for event in events_for(message) {
        // no subscribers left is not an error
        let _ = sender.send(event);
    }
}
