use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::core::models::ThreadId;
use crate::error::{Result, SyncError};
use crate::sync::cache::Coordinator;

/// Push-channel scope. Events carry nothing but the topic; receivers re-validate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// The global thread feed (`threads`).
    Threads,
    /// A single thread's responses (`thread:<id>`).
    Thread(ThreadId),
    /// A user's inbox (`inbox:<user_id>`).
    Inbox(String),
}

impl FromStr for Topic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "threads" {
            return Ok(Topic::Threads);
        }
        match s.split_once(':') {
            Some(("thread", id)) => id
                .parse()
                .map(Topic::Thread)
                .map_err(|_| SyncError::UnknownTopic(s.to_string())),
            Some(("inbox", user)) if !user.is_empty() => Ok(Topic::Inbox(user.to_string())),
            _ => Err(SyncError::UnknownTopic(s.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Threads => f.write_str("threads"),
            Topic::Thread(id) => write!(f, "thread:{id}"),
            Topic::Inbox(user) => write!(f, "inbox:{user}"),
        }
    }
}

/// Subscribe/unsubscribe side of the push transport.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> Result<()>;
    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;
}

/// Bring the channel's subscriptions in line with the topics the cache
/// currently has watchers for. `subscribed` is the caller's record of what
/// the channel already knows about and is updated in place.
pub async fn sync_topics(
    channel: &dyn PushChannel,
    coordinator: &Coordinator,
    subscribed: &mut HashSet<Topic>,
) -> Result<()> {
    let wanted: HashSet<Topic> = coordinator.active_topics().into_iter().collect();

    let mut to_drop: Vec<Topic> = subscribed.difference(&wanted).cloned().collect();
    to_drop.sort();
    for topic in to_drop {
        channel.unsubscribe(&topic).await?;
        log::debug!("Push unsubscribe {}", topic);
        subscribed.remove(&topic);
    }

    let mut to_add: Vec<Topic> = wanted.difference(subscribed).cloned().collect();
    to_add.sort();
    for topic in to_add {
        channel.subscribe(&topic).await?;
        log::debug!("Push subscribe {}", topic);
        subscribed.insert(topic);
    }
    Ok(())
}

/// Drain raw topic strings from the push transport into the coordinator.
/// Unparseable topics are logged and skipped. Returns when the stream ends.
pub async fn listen<S>(events: S, coordinator: &Coordinator) -> usize
where
    S: Stream<Item = String>,
{
    let mut events = std::pin::pin!(events);
    let mut handled = 0;
    while let Some(raw) = events.next().await {
        match raw.parse::<Topic>() {
            Ok(topic) => {
                let marked = coordinator.invalidate(&topic);
                log::debug!("Push event {} marked {} entries", topic, marked);
                handled += 1;
            }
            Err(e) => {
                log::warn!("Ignoring push event: {}", e);
            }
        }
    }
    log::debug!("Push stream ended after {} events", handled);
    handled
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::sync::cache::{CacheKey, StalePolicy};
    use crate::sync::cache::tests::CountingLoader;

    #[test]
    fn topic_parse_and_display() {
        for raw in ["threads", "thread:42", "inbox:alice", "thread:-1"] {
            let topic: Topic = raw.parse().unwrap();
            assert_eq!(topic.to_string(), raw);
        }
        assert_eq!("thread:7".parse::<Topic>().unwrap(), Topic::Thread(7));
        assert_eq!(
            "inbox:a:b".parse::<Topic>().unwrap(),
            Topic::Inbox("a:b".into())
        );
    }

    #[test]
    fn bad_topics_rejected() {
        for raw in ["", "thread", "thread:x", "inbox:", "global", "user:1"] {
            assert!(
                matches!(raw.parse::<Topic>(), Err(SyncError::UnknownTopic(_))),
                "{raw:?}"
            );
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushChannel for RecordingChannel {
        async fn subscribe(&self, topic: &Topic) -> Result<()> {
            self.log.lock().unwrap().push(format!("+{topic}"));
            Ok(())
        }
        async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
            self.log.lock().unwrap().push(format!("-{topic}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn channel_follows_subscriber_set() {
        let coordinator = Coordinator::new(
            Arc::new(CountingLoader::default()),
            StalePolicy::uniform(std::time::Duration::from_secs(60)),
            None,
        );
        let channel = RecordingChannel::default();
        let mut subscribed = HashSet::new();

        let detail = CacheKey::thread_detail(9, "alice");
        let inbox = CacheKey::unread_count("alice");
        coordinator.subscribe(&detail);
        coordinator.subscribe(&inbox);
        sync_topics(&channel, &coordinator, &mut subscribed).await.unwrap();
        assert_eq!(
            *channel.log.lock().unwrap(),
            vec!["+thread:9".to_string(), "+inbox:alice".to_string()]
        );

        coordinator.unsubscribe(&detail);
        sync_topics(&channel, &coordinator, &mut subscribed).await.unwrap();
        assert_eq!(channel.log.lock().unwrap().last().unwrap(), "-thread:9");
        assert_eq!(subscribed, HashSet::from([Topic::Inbox("alice".into())]));
    }

    #[tokio::test]
    async fn listen_invalidates_and_skips_garbage() {
        let coordinator = Coordinator::new(
            Arc::new(CountingLoader::default()),
            StalePolicy::uniform(std::time::Duration::from_secs(60)),
            None,
        );
        let key = CacheKey::thread_detail(3, "alice");
        coordinator.read(&key).await.unwrap();

        let events = futures::stream::iter(vec![
            "bogus".to_string(),
            "thread:4".to_string(),
            "thread:3".to_string(),
        ]);
        assert_eq!(listen(events, &coordinator).await, 2);
        assert!(coordinator.is_dirty(&key));
    }
}
