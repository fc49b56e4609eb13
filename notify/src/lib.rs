//! Batch notification fan-out.
//!
//! The persistence stage only ever speaks the broker contract: it offers a
//! `BatchInfo` onto the batch-info topic. The notify service drains that
//! topic and broadcasts each event to every registered subscriber over its
//! own bounded channel, so a slow subscriber never blocks persistence.

use primordia_broker::{Broker, StreamingBatch};
use primordia_channel::{bounded, select, Receiver, Sender};
use primordia_logger::{debug, trace, warn};
use primordia_types::service::Request;
use primordia_types::BatchInfo;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

/// Capacity of the subscriber registration channel.
pub const REGISTER_CHANNEL_SIZE: usize = 2;
/// Capacity of the internal notification channel.
pub const NOTIFY_CHANNEL_SIZE: usize = 128;

const TOPIC_POLL_TIMEOUT: Duration = Duration::from_millis(500);
const TOPIC_BATCH_SIZE: usize = 32;

type StopSignal = ();
/// Message fanned out to batch subscribers.
pub type MsgNewBatch = Arc<BatchInfo>;
/// Registration channel alias.
pub type NotifyRegister<M> = Sender<Request<(String, usize), Receiver<M>>>;

/// The fan-out service.
#[derive(Default)]
pub struct NotifyService {}

/// Cloneable controller over a running [`NotifyService`].
#[derive(Clone)]
pub struct NotifyController {
    signal: Sender<StopSignal>,
    new_batch_register: NotifyRegister<MsgNewBatch>,
    new_batch_notifier: Sender<MsgNewBatch>,
}

impl NotifyService {
    /// Starts the service thread and returns its controller.
    pub fn start<S: ToString>(self, thread_name: Option<S>) -> (JoinHandle<()>, NotifyController) {
        let (signal_sender, signal_receiver) = bounded::<StopSignal>(REGISTER_CHANNEL_SIZE);
        let (new_batch_register, new_batch_register_receiver) = bounded(REGISTER_CHANNEL_SIZE);
        let (new_batch_sender, new_batch_receiver) = bounded::<MsgNewBatch>(NOTIFY_CHANNEL_SIZE);

        let mut new_batch_subscribers: HashMap<String, Sender<MsgNewBatch>> = HashMap::new();

        let mut thread_builder = thread::Builder::new();
        if let Some(name) = thread_name {
            thread_builder = thread_builder.name(name.to_string());
        }
        let join_handle = thread_builder
            .spawn(move || loop {
                select! {
                    recv(signal_receiver) -> _ => {
                        break;
                    }
                    recv(new_batch_register_receiver) -> msg => Self::handle_register_new_batch(
                        &mut new_batch_subscribers, msg
                    ),
                    recv(new_batch_receiver) -> msg => Self::handle_notify_new_batch(
                        &new_batch_subscribers, msg
                    ),
                }
            })
            .expect("start notify service failed");

        (
            join_handle,
            NotifyController {
                new_batch_register,
                new_batch_notifier: new_batch_sender,
                signal: signal_sender,
            },
        )
    }

    fn handle_register_new_batch(
        subscribers: &mut HashMap<String, Sender<MsgNewBatch>>,
        msg: Result<Request<(String, usize), Receiver<MsgNewBatch>>, primordia_channel::RecvError>,
    ) {
        match msg {
            Ok(Request {
                responder,
                arguments: (name, capacity),
            }) => {
                debug!("register new_batch {:?}", name);
                let (sender, receiver) = bounded::<MsgNewBatch>(capacity);
                subscribers.insert(name, sender);
                let _ = responder.send(receiver);
            }
            _ => warn!("register new_batch channel is closed"),
        }
    }

    fn handle_notify_new_batch(
        subscribers: &HashMap<String, Sender<MsgNewBatch>>,
        msg: Result<MsgNewBatch, primordia_channel::RecvError>,
    ) {
        match msg {
            Ok(msg) => {
                trace!("event new batch {:?}", msg);
                for (name, subscriber) in subscribers {
                    if subscriber.try_send(Arc::clone(&msg)).is_err() {
                        warn!("subscriber {} lags behind, notification dropped", name);
                    }
                }
            }
            _ => warn!("new batch channel is closed"),
        }
    }
}

impl NotifyController {
    /// Stops the service loop.
    pub fn stop(self) {
        let _ = self.signal.send(());
    }

    /// Registers a named subscriber and returns its receiver.
    pub fn subscribe_new_batch<S: ToString>(&self, name: S) -> Receiver<MsgNewBatch> {
        Request::call(&self.new_batch_register, (name.to_string(), NOTIFY_CHANNEL_SIZE))
            .expect("subscribe new batch failed")
    }

    /// Feeds one batch event into the fan-out.
    pub fn notify_new_batch(&self, info: MsgNewBatch) {
        let _ = self.new_batch_notifier.send(info);
    }
}

/// Pumps the batch-info topic into the fan-out until the exit signal fires.
///
/// The topic is an ordinary broker, so the pump is just another competing
/// consumer; batches are committed after broadcast.
pub fn start_topic_pump(
    topic: Arc<dyn Broker<BatchInfo>>,
    notify: NotifyController,
    exit_rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("BatchTopicPump".into())
        .spawn(move || loop {
            if exit_rx.try_recv().is_ok() {
                debug!("batch topic pump exiting");
                break;
            }
            let mut batch = match topic.receive_batch(TOPIC_BATCH_SIZE, TOPIC_POLL_TIMEOUT) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("batch topic receive failed: {}", e);
                    continue;
                }
            };
            while let Some(item) = batch.next_item() {
                match item {
                    Ok(info) => notify.notify_new_batch(Arc::new(info)),
                    Err(e) => warn!("batch topic payload rejected: {}", e),
                }
            }
            if let Err(e) = batch.commit() {
                warn!("batch topic commit failed: {}", e);
            }
            let _ = batch.close();
        })
        .expect("start batch topic pump failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordia_broker::MemoryBroker;

    fn info(tick: u64) -> BatchInfo {
        BatchInfo {
            simulation_run_id: "run".to_string(),
            storage_path: format!("run/batch-{}-{}", tick, tick),
            tick_start: tick,
            tick_end: tick,
            written_at_ms: 0,
        }
    }

    #[test]
    fn fan_out_reaches_every_subscriber() {
        let (handle, notify) = NotifyService::default().start::<&str>(None);
        let receiver1 = notify.subscribe_new_batch("indexer1");
        let receiver2 = notify.subscribe_new_batch("indexer2");

        let event = Arc::new(info(8));
        notify.notify_new_batch(Arc::clone(&event));
        assert_eq!(
            receiver1.recv_timeout(Duration::from_secs(1)),
            Ok(Arc::clone(&event))
        );
        assert_eq!(receiver2.recv_timeout(Duration::from_secs(1)), Ok(event));

        notify.stop();
        handle.join().expect("join failed");
    }

    #[test]
    fn topic_pump_bridges_broker_to_subscribers() {
        let topic: Arc<dyn Broker<BatchInfo>> = Arc::new(MemoryBroker::new(16));
        let (handle, notify) = NotifyService::default().start(Some("NotifyService"));
        let receiver = notify.subscribe_new_batch("indexer");

        let (exit_tx, exit_rx) = bounded(1);
        let pump = start_topic_pump(Arc::clone(&topic), notify.clone(), exit_rx);

        topic.put(info(1)).unwrap();
        topic.put(info(2)).unwrap();

        let first = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = receiver.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.tick_start, 1);
        assert_eq!(second.tick_start, 2);

        exit_tx.send(()).unwrap();
        pump.join().unwrap();
        notify.stop();
        handle.join().unwrap();
    }
}
