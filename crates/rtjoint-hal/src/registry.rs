//! [`ChannelRegistry`] – the single owner of every hardware channel.
//!
//! Channels are stored in registration order (which is also the order they
//! are sampled and reported in) and addressed by their stable identifier.
//! There is no ambient global table: whoever owns the registry owns the
//! hardware.

use std::collections::HashMap;

use rtjoint_types::ControlError;
use tracing::error;

use crate::channel::HardwareChannel;

/// Central channel registry.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Vec<Box<dyn HardwareChannel>>,
    index: HashMap<String, usize>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel.  A previously registered channel with the same id
    /// is replaced in place, keeping its position in the sampling order.
    pub fn register(&mut self, channel: Box<dyn HardwareChannel>) {
        let id = channel.id().to_string();
        match self.index.get(&id) {
            Some(&slot) => self.channels[slot] = channel,
            None => {
                self.index.insert(id, self.channels.len());
                self.channels.push(channel);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Channel identifiers in sampling order.
    pub fn ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.channels.iter().map(|c| c.id())
    }

    /// Look up a channel by id.
    pub fn get(&self, id: &str) -> Result<&dyn HardwareChannel, ControlError> {
        self.index
            .get(id)
            .map(|&slot| self.channels[slot].as_ref())
            .ok_or_else(|| ControlError::UnknownChannel(id.to_string()))
    }

    /// Look up a channel by id for I/O.
    pub fn get_mut(&mut self, id: &str) -> Result<&mut dyn HardwareChannel, ControlError> {
        let slot = *self
            .index
            .get(id)
            .ok_or_else(|| ControlError::UnknownChannel(id.to_string()))?;
        let channel: &mut dyn HardwareChannel = self.channels[slot].as_mut();
        Ok(channel)
    }

    /// All channels in sampling order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn HardwareChannel> + '_ {
        self.channels.iter().map(|c| c.as_ref())
    }

    /// Mutable access to every channel, e.g. to fan I/O out across worker
    /// threads.
    pub fn channels_mut(&mut self) -> &mut [Box<dyn HardwareChannel>] {
        &mut self.channels
    }

    /// Call [`HardwareChannel::emergency_stop`] on every channel.
    ///
    /// Returns the number of channels stopped.
    pub fn emergency_stop_all(&mut self) -> usize {
        for channel in &mut self.channels {
            channel.emergency_stop();
        }
        error!(channels = self.channels.len(), "emergency stop broadcast to all channels");
        self.channels.len()
    }
}
