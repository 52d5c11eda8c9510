use std::sync::{Arc, Mutex, MutexGuard};

/// # A piece of shareable state
/// This struct wraps the common
/// Arc<Mutex<Data>> pattern used
/// for internal mutability.
///
/// A poisoned mutex is recovered: one controller
/// thread panicking must not take the state of
/// every other thread down with it.
pub struct Shareable<T>
{
    data: Arc<Mutex<T>>
}

impl<T> Shareable<T>
{
    pub fn new(data: T) -> Self
    {
        Shareable
        {
            data: Arc::new(Mutex::new(data))
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T>
    {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swaps the whole value in one step and hands back the old one.
    pub fn replace(&self, value: T) -> T
    {
        std::mem::replace(&mut *self.lock(), value)
    }
}

impl<T: Clone> Shareable<T>
{
    pub fn snapshot(&self) -> T
    {
        self.lock().clone()
    }
}

impl<T: Default> Default for Shareable<T>
{
    fn default() -> Self
    {
        Shareable::new(T::default())
    }
}

impl<T> Clone for Shareable<T>
{
    fn clone(&self) -> Self
    {
        Shareable
        {
            data: self.data.clone()
        }
    }
}
