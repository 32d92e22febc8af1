pub mod arena;
pub mod chanmap;
pub mod dev;
mod engine;
pub mod fmt;
pub mod hw;
pub mod message;
pub mod resamp;
pub mod ring;
pub mod slot;
pub mod transport;

use tokio::sync::mpsc::{Sender, channel};
use tokio::task::JoinHandle;

pub fn init() -> (Sender<message::Action>, JoinHandle<()>) {
    let (tx, rx) = channel::<message::Action>(256);
    let mut engine = engine::Engine::new(rx);
    let handle = tokio::spawn(async move {
        engine.work().await;
    });
    (tx, handle)
}
