use crate::net::frame::{Cmd, Pkg};
use crate::net::shared::{Key, EGRESS_KEY};
use hashbrown::HashMap;
use sluice::logging::{self, Logger};
use sluice::time::timestamp_secs;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One per-key packet FIFO plus its liveness and ownership state. The
/// registry map lock, the queue lock and the ownership token are three
/// independent tiers; none is ever held across socket I/O.
struct Mailbox {
    queue: Mutex<VecDeque<Pkg>>,
    owned: AtomicBool,
    last_active: AtomicU64,
}

impl Mailbox {
    fn new() -> Mailbox {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            owned: AtomicBool::new(false),
            last_active: AtomicU64::new(timestamp_secs()),
        }
    }

    #[inline]
    fn touch(&self) {
        self.last_active.store(timestamp_secs(), Ordering::Relaxed);
    }
}

/// Key-indexed registry of mailboxes shared by every session worker and
/// the carrier worker of one peer. Key `0` is the shared egress queue:
/// it lives in the same map but bypasses ownership.
pub struct Channel {
    map: Mutex<HashMap<Key, Arc<Mailbox>>>,
    log: Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> Channel {
        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => Logger::root(logging::Discard, logging::o!()),
        };

        Channel {
            map: Mutex::new(HashMap::new()),
            log: channel_log,
        }
    }

    /// Looks up mailbox `k`, creating it when `create` is set. A hit
    /// refreshes `last_active`; an actively polled mailbox is alive even
    /// when it stays empty.
    fn mailbox(&self, k: Key, create: bool) -> Option<Arc<Mailbox>> {
        let mut map = self.map.lock().expect("Channel map lock poisoned");

        match map.get(&k) {
            Some(mailbox) => {
                mailbox.touch();
                Some(mailbox.clone())
            }
            None if create => {
                let mailbox = Arc::new(Mailbox::new());
                map.insert(k, mailbox.clone());
                Some(mailbox)
            }
            None => None,
        }
    }

    /// Appends `pkg` to mailbox `k`, creating the mailbox if absent.
    pub fn push(&self, k: Key, pkg: Pkg) {
        let mailbox = self.mailbox(k, true).expect("mailbox was just created");
        let mut queue = mailbox.queue.lock().expect("Mailbox queue lock poisoned");
        queue.push_back(pkg);
    }

    /// Removes and returns the head of mailbox `k`, or `None` when the
    /// mailbox is absent or empty.
    pub fn pop(&self, k: Key) -> Option<Pkg> {
        let mailbox = self.mailbox(k, false)?;
        let mut queue = mailbox.queue.lock().expect("Mailbox queue lock poisoned");
        queue.pop_front()
    }

    /// Attempts to acquire the exclusive ownership token of `k`. Returns
    /// false without blocking when the key is already owned.
    pub fn own(&self, k: Key) -> bool {
        assert_ne!(k, EGRESS_KEY, "the egress queue cannot be owned");

        let mailbox = self.mailbox(k, true).expect("mailbox was just created");
        mailbox
            .owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Removes mailbox `k`, discarding anything still queued and releasing
    /// the ownership token with it.
    pub fn free(&self, k: Key) {
        let mut map = self.map.lock().expect("Channel map lock poisoned");
        map.remove(&k);
    }

    /// Reaps every mailbox idle for longer than `max_idle`. Two passes
    /// under the map lock: collect the victims, then erase them.
    pub fn garbage_cleanup(&self, max_idle: Duration) {
        let now = timestamp_secs();
        let max_idle = max_idle.as_secs();
        let mut map = self.map.lock().expect("Channel map lock poisoned");

        let dead: Vec<Key> = map
            .iter()
            .filter(|(_, mailbox)| mailbox.last_active.load(Ordering::Relaxed) + max_idle < now)
            .map(|(&k, _)| k)
            .collect();

        for k in dead {
            logging::info!(self.log, "garbage cleanup"; "key" => k);
            map.remove(&k);
        }
    }

    /// Pushes a synthetic `Close` into every session mailbox. Invoked on
    /// carrier loss so in-flight sessions end without waiting out the idle
    /// timeout.
    pub fn close_all(&self) {
        let mailboxes: Vec<(Key, Arc<Mailbox>)> = {
            let map = self.map.lock().expect("Channel map lock poisoned");
            map.iter()
                .filter(|(&k, _)| k != EGRESS_KEY)
                .map(|(&k, mailbox)| (k, mailbox.clone()))
                .collect()
        };

        for (k, mailbox) in mailboxes {
            logging::debug!(self.log, "closing session on carrier loss"; "key" => k);
            let mut queue = mailbox.queue.lock().expect("Mailbox queue lock poisoned");
            queue.push_back(Pkg::control(k, Cmd::Close));
        }
    }

    /// Acquires exclusive ownership of `key`, returning a guard that frees
    /// the mailbox when dropped. `None` means the key is already owned.
    pub fn claim(self: &Arc<Self>, key: Key) -> Option<Claim> {
        if self.own(key) {
            Some(Claim {
                channel: self.clone(),
                key,
            })
        } else {
            None
        }
    }
}

/// RAII ownership of a session key: frees the mailbox on drop so every
/// worker exit path, panics included, releases its key.
pub struct Claim {
    channel: Arc<Channel>,
    key: Key,
}

impl Claim {
    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.channel.free(self.key);
    }
}
