use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use tokio::sync::mpsc;

type Subscribers<E> = Vec<(u64, mpsc::UnboundedSender<E>)>;

struct BusInner<K, E> {
    next_id: u64,
    topics: HashMap<K, Subscribers<E>>,
    wildcard: Subscribers<E>,
}

/// 按主题分发事件的发布订阅通道
///
/// 每个订阅持有独立的接收队列，订阅句柄被 drop 时自动退订
pub struct EventBus<K, E> {
    inner: Arc<Mutex<BusInner<K, E>>>,
}

impl<K, E> Clone for EventBus<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, E> Default for EventBus<K, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> EventBus<K, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                topics: HashMap::new(),
                wildcard: Vec::new(),
            })),
        }
    }

    /// 订阅单个主题
    pub fn subscribe(&self, topic: K) -> Subscription<K, E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.topics.entry(topic.clone()).or_default().push((id, tx));

        Subscription {
            id,
            topic: Some(topic),
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 订阅所有主题
    pub fn subscribe_all(&self) -> Subscription<K, E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.wildcard.push((id, tx));

        Subscription {
            id,
            topic: None,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 发布事件，返回投递到的订阅者数量
    pub fn publish(&self, topic: &K, event: E) -> usize {
        let mut inner = self.inner.lock();
        let mut delivered = 0;

        if let Some(subscribers) = inner.topics.get_mut(topic) {
            subscribers.retain(|(_, tx)| {
                let ok = tx.send(event.clone()).is_ok();
                delivered += ok as usize;
                ok
            });
        }
        inner.wildcard.retain(|(_, tx)| {
            let ok = tx.send(event.clone()).is_ok();
            delivered += ok as usize;
            ok
        });

        delivered
    }

    pub fn subscriber_count(&self, topic: &K) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

/// 订阅句柄
pub struct Subscription<K, E> {
    id: u64,
    topic: Option<K>,
    rx: mpsc::UnboundedReceiver<E>,
    bus: Weak<Mutex<BusInner<K, E>>>,
}

impl<K, E> Subscription<K, E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> Option<&K> {
        self.topic.as_ref()
    }

    /// 等待下一个事件；总线被释放后返回 `None`
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// 主动退订，等同于 drop
    pub fn unsubscribe(self) {}
}

impl<K, E> Drop for Subscription<K, E> {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        // K 的 Hash/Eq 约束只在 EventBus 上，这里按 id 线性查找
        let mut inner = bus.lock();
        let id = self.id;
        if self.topic.is_some() {
            for subscribers in inner.topics.values_mut() {
                subscribers.retain(|(sub_id, _)| *sub_id != id);
            }
        } else {
            inner.wildcard.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}
