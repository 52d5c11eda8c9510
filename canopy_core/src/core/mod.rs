/*

The canopy core services module contains the infrastructure
for the rest of the daemon, most notably

* shareable state and events used by the controller threads
* the typed broadcast channels and the channel manager that
  hands them out
* the timer used for timed output switch-back

*/

pub mod shareable;
pub mod event;
pub mod broadcast_channel;
pub mod channel_manager;
pub mod timer;

#[derive(Clone, Debug, PartialEq)]
pub enum SystemMessage
{
    Shutdown,
    InputStarted(String),
    InputStopped(String),
}
