use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

const GARBAGE_THRESHOLD: usize = 10;

struct ReceiverQueue<T>
{
    data: Mutex<VecDeque<T>>,
    signal: Condvar
}

impl<T> ReceiverQueue<T>
{
    fn new() -> Self
    {
        Self { data: Mutex::new(VecDeque::new()), signal: Condvar::new() }
    }

    fn push(&self, item: T)
    {
        self.data.lock().unwrap_or_else(|p| p.into_inner()).push_back(item);
        self.signal.notify_one();
    }
}

/// # Broadcast channel
/// Every message sent is delivered to every receiver that is alive
/// at the time of sending. Sending never blocks and a channel without
/// receivers silently drops the message, which is exactly the
/// fire-and-forget behaviour the persistence and output paths need.
pub struct ChannelImpl<T: Clone>
{
    receiver_queues: Mutex<Vec<Weak<ReceiverQueue<T>>>>
}

impl<T: Clone> ChannelImpl<T>
{
    pub fn new() -> Self
    {
        ChannelImpl { receiver_queues: Mutex::new(Vec::new()) }
    }

    pub fn push_message(&self, data: T)
    {
        let mut queues = self.receiver_queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut garbage = 0;
        for weak in queues.iter()
        {
            match weak.upgrade()
            {
                Some(queue) => queue.push(data.clone()),
                None => garbage += 1
            }
        }

        // Dropped receivers leave dead weak refs behind, collect them
        // once there are enough of them to matter.
        if garbage > GARBAGE_THRESHOLD
        {
            queues.retain(|x| x.upgrade().is_some());
        }
    }

    fn add_receiver(&self, receiver: &Arc<ReceiverQueue<T>>)
    {
        self.receiver_queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::downgrade(receiver))
    }
}

impl<T: Clone> Default for ChannelImpl<T>
{
    fn default() -> Self
    {
        Self::new()
    }
}

pub fn make_receiver<T: Clone>(owner: &Arc<ChannelImpl<T>>) -> GenericReceiver<T>
{
    let queue = Arc::new(ReceiverQueue::new());
    owner.add_receiver(&queue);
    GenericReceiver { queue, owner: owner.clone() }
}

pub fn make_sender<T: Clone>(owner: &Arc<ChannelImpl<T>>) -> GenericSender<T>
{
    GenericSender { source: owner.clone() }
}

pub fn make_chan<T: Clone>() -> (GenericSender<T>, GenericReceiver<T>)
{
    let chan = Arc::new(ChannelImpl::<T>::new());
    let receiver = make_receiver(&chan);
    (make_sender(&chan), receiver)
}

pub struct GenericReceiver<T: Clone>
{
    queue: Arc<ReceiverQueue<T>>,
    owner: Arc<ChannelImpl<T>>
}

impl<T: Clone> GenericReceiver<T>
{
    pub fn create_sender(&self) -> GenericSender<T>
    {
        make_sender(&self.owner)
    }

    /// A new receiver on the same channel. It only sees messages sent
    /// after it was created.
    pub fn clone_receiver(&self) -> Self
    {
        make_receiver(&self.owner)
    }

    pub fn has_data(&self) -> bool
    {
        !self.queue.data.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    pub fn try_receive(&self) -> Option<T>
    {
        self.queue.data.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    pub fn receive(&self) -> T
    {
        let mut data = self.queue.data.lock().unwrap_or_else(|p| p.into_inner());
        loop
        {
            if let Some(item) = data.pop_front()
            {
                return item;
            }
            data = self.queue.signal.wait(data).unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn receive_with_timeout(&self, timeout: Duration) -> Option<T>
    {
        let deadline = Instant::now() + timeout;
        let mut data = self.queue.data.lock().unwrap_or_else(|p| p.into_inner());
        loop
        {
            if let Some(item) = data.pop_front()
            {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline
            {
                return None;
            }
            data = self.queue.signal
                       .wait_timeout(data, deadline - now)
                       .unwrap_or_else(|p| p.into_inner())
                       .0;
        }
    }
}

pub struct GenericSender<T: Clone>
{
    source: Arc<ChannelImpl<T>>
}

impl<T: Clone> GenericSender<T>
{
    pub fn send(&self, data: T)
    {
        self.source.push_message(data);
    }
}

impl<T: Clone> Clone for GenericSender<T>
{
    fn clone(&self) -> Self
    {
        GenericSender { source: self.source.clone() }
    }
}
