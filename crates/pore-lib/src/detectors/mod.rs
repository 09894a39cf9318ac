pub mod events;
pub mod worker;

use crate::pipeline::Message;

/// Destination for the messages a detector produces.
pub trait MessageSink {
    fn send(&mut self, message: Message) -> anyhow::Result<()>;
}

impl MessageSink for Vec<Message> {
    fn send(&mut self, message: Message) -> anyhow::Result<()> {
        self.push(message);
        Ok(())
    }
}

pub use events::find_events;
