use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Signals delivered to the agent by its host adapter.
///
/// The layer never drives its own lifecycle; whatever hooks a host offers
/// (browser events, a webview bridge, an OS scheduler) are translated into
/// these events and injected through [`EventHandler::sender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Connectivity changed; `true` means online
  Connectivity(bool),
  /// Foreground visibility changed; `true` means visible
  Visibility(bool),
  /// Explicit user- or application-initiated flush
  FlushRequested,
  /// Periodic timer for queue maintenance and fallback flushing
  Tick,
  /// The host is shutting the layer down
  Shutdown,
}

/// Event source combining host-injected signals with a periodic tick.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate.
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn the tick timer; host signals share the same channel
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = interval_at(Instant::now() + tick_rate, tick_rate);
      interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for host adapters to inject platform signals.
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event.
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_injected_signals_are_delivered_in_order() {
    let mut events = EventHandler::new(Duration::from_secs(3600));
    let sender = events.sender();

    sender.send(Event::Connectivity(true)).unwrap();
    sender.send(Event::FlushRequested).unwrap();

    assert_eq!(events.next().await, Some(Event::Connectivity(true)));
    assert_eq!(events.next().await, Some(Event::FlushRequested));
  }

  #[tokio::test]
  async fn test_tick_fires_at_the_configured_rate() {
    let mut events = EventHandler::new(Duration::from_millis(10));
    assert_eq!(events.next().await, Some(Event::Tick));
  }
}
