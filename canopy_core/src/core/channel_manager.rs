use crate::core::broadcast_channel::*;
extern crate anymap;
use crate::core::shareable::Shareable;
use anymap::Map;
use std::sync::Arc;

type ChannelMap = Map<dyn anymap::any::Any + Send + Sync>;

/// # Channel manager
/// Hands out typed senders and receivers. All senders and receivers
/// for a given message type share one broadcast channel, so a component
/// only needs to know the message type to talk to its peers.
pub struct ChannelManager
{
    channels: Shareable<ChannelMap>,
}

impl ChannelManager
{
    pub fn new() -> Self
    {
        ChannelManager {
            channels: Shareable::new(ChannelMap::new()),
        }
    }

    fn channel<T: 'static + Clone + Send>(&self) -> Arc<ChannelImpl<T>>
    {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get::<Arc<ChannelImpl<T>>>()
        {
            return existing.clone();
        }
        let chan = Arc::new(ChannelImpl::<T>::new());
        channels.insert(chan.clone());
        chan
    }

    pub fn get_receiver<T: 'static + Clone + Send>(&self) -> GenericReceiver<T>
    {
        make_receiver(&self.channel::<T>())
    }

    pub fn get_sender<T: 'static + Clone + Send>(&self) -> GenericSender<T>
    {
        make_sender(&self.channel::<T>())
    }
}

impl Default for ChannelManager
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Clone for ChannelManager
{
    fn clone(&self) -> Self
    {
        Self
        {
            channels: self.channels.clone()
        }
    }
}
