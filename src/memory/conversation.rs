//! 对话历史
//!
//! Message 为带标签的枚举（system / user / assistant / tool），每种角色的字段在编译期确定；
//! Conversation 只追加，按 id 存放在 ConversationStore 中，每个对话一把异步锁，
//! 保证同一对话的轮次串行、不同对话互不阻塞。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::core::ErrorKind;

/// 模型请求执行的一个动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// 关联 id，用于把结果对应回请求
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// 动作执行结果：成功载荷或失败描述，总会产生
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success { output: String },
    Failure { kind: ErrorKind, message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub call_id: String,
    pub name: String,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

impl ActionResult {
    pub fn success(request: &ActionRequest, output: impl Into<String>) -> Self {
        Self {
            call_id: request.id.clone(),
            name: request.name.clone(),
            outcome: ActionOutcome::Success {
                output: output.into(),
            },
        }
    }

    pub fn failure(request: &ActionRequest, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_id: request.id.clone(),
            name: request.name.clone(),
            outcome: ActionOutcome::Failure {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            ActionOutcome::Failure { kind, .. } => Some(*kind),
            ActionOutcome::Success { .. } => None,
        }
    }

    /// 交回模型的文本
    pub fn content(&self) -> String {
        match &self.outcome {
            ActionOutcome::Success { output } => output.clone(),
            ActionOutcome::Failure { kind, message } => format!("Error ({kind:?}): {message}"),
        }
    }
}

/// 单条消息，追加后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actions: Vec<ActionRequest>,
    },
    Tool {
        result: ActionResult,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
            source: None,
        }
    }

    pub fn user_from(content: impl Into<String>, source: Option<String>) -> Self {
        Message::User {
            content: content.into(),
            source,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: content.into(),
            actions: Vec::new(),
        }
    }

    pub fn assistant_with_actions(content: impl Into<String>, actions: Vec<ActionRequest>) -> Self {
        Message::Assistant {
            content: content.into(),
            actions,
        }
    }

    pub fn tool(result: ActionResult) -> Self {
        Message::Tool { result }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Tool { .. } => "tool",
        }
    }

    pub fn text(&self) -> String {
        match self {
            Message::System { content }
            | Message::User { content, .. }
            | Message::Assistant { content, .. } => content.clone(),
            Message::Tool { result } => result.content(),
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }
}

/// 一个对话：稳定 id + 只追加的消息序列
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 丢弃全部消息
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    /// 超过 max 条时丢弃最旧的消息；只在 user 消息处截断，保证 tool 结果不与其请求分离。
    /// 返回丢弃条数
    pub fn prune_to(&mut self, max: usize) -> usize {
        if max == 0 || self.messages.len() <= max {
            return 0;
        }
        let earliest = self.messages.len() - max;
        let cut = self.messages[earliest..]
            .iter()
            .position(Message::is_user)
            .map(|offset| earliest + offset);
        match cut {
            Some(cut) if cut > 0 => {
                self.messages.drain(..cut);
                cut
            }
            _ => 0,
        }
    }
}

pub type SharedConversation = Arc<tokio::sync::Mutex<Conversation>>;

struct StoreEntry {
    conversation: SharedConversation,
    last_used: Instant,
}

impl StoreEntry {
    /// 没有 turn、快照或 clear 持有它
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.conversation) == 1
    }
}

/// 按 id 存放对话；每个对话一把 tokio Mutex，turn 期间持有。
///
/// 对话数有上限时，新建对话会先淘汰最久未用且空闲的对话；
/// 正被持有的对话永远不会被淘汰，全部忙碌时暂时超出上限。
#[derive(Default)]
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, StoreEntry>>,
    /// 0 表示不限
    max_conversations: usize,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_conversations(mut self, max: usize) -> Self {
        self.max_conversations = max;
        self
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoreEntry>> {
        match self.conversations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 取得或创建对话（只持有全局 map 锁极短时间，不跨 await）
    pub fn get_or_create(&self, id: &str) -> SharedConversation {
        let mut map = self.map();
        let now = Instant::now();
        if let Some(entry) = map.get_mut(id) {
            entry.last_used = now;
            return Arc::clone(&entry.conversation);
        }

        if self.max_conversations > 0 {
            while map.len() >= self.max_conversations {
                let oldest = map
                    .iter()
                    .filter(|(_, entry)| entry.is_idle())
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => {
                        map.remove(&key);
                        tracing::debug!(conversation_id = %key, "evicted least recently used conversation");
                    }
                    None => {
                        tracing::warn!(
                            max = self.max_conversations,
                            live = map.len(),
                            "all conversations busy, store over its limit"
                        );
                        break;
                    }
                }
            }
        }

        let conversation = Arc::new(tokio::sync::Mutex::new(Conversation::new(id)));
        map.insert(
            id.to_string(),
            StoreEntry {
                conversation: Arc::clone(&conversation),
                last_used: now,
            },
        );
        conversation
    }

    /// 标记对话刚被使用（轮次结束时调用，空闲时间从此刻算起）
    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.map().get_mut(id) {
            entry.last_used = Instant::now();
        }
    }

    /// 删除超过 idle 未使用且当前空闲的对话，返回删除数
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, entry| !entry.is_idle() || now.duration_since(entry.last_used) < idle);
        before - map.len()
    }

    /// 对话历史的副本；会等待进行中的 turn 结束以得到一致视图
    pub async fn snapshot(&self, id: &str) -> Option<Vec<Message>> {
        let conversation = self.map().get(id).map(|entry| Arc::clone(&entry.conversation))?;
        let guard = conversation.lock().await;
        Some(guard.messages().to_vec())
    }

    /// 清空对话：等进行中的 turn 结束后清掉历史；
    /// 没有排队的 turn 时顺带从 map 中移除，否则留下空对话给排队者继续使用
    pub async fn clear(&self, id: &str) -> bool {
        let Some(conversation) = self.map().get(id).map(|entry| Arc::clone(&entry.conversation))
        else {
            return false;
        };
        let mut guard = conversation.lock().await;
        guard.reset();

        let mut map = self.map();
        let ours = map
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.conversation, &conversation));
        // map 与本函数各持一份
        if ours && Arc::strong_count(&conversation) == 2 {
            map.remove(id);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(name: &str) -> ActionRequest {
        ActionRequest {
            id: format!("call_{name}"),
            name: name.to_string(),
            arguments: json!({}),
        }
    }

    #[test]
    fn test_message_serde_is_tagged_by_role() {
        let msg = Message::assistant_with_actions("", vec![request("echo")]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["actions"][0]["name"], "echo");

        let tool = Message::tool(ActionResult::failure(
            &request("echo"),
            ErrorKind::UnknownTool,
            "nope",
        ));
        let value = serde_json::to_value(&tool).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["result"]["status"], "failure");
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, tool);
    }

    #[test]
    fn test_prune_cuts_at_user_boundary() {
        let mut conv = Conversation::new("c");
        conv.push(Message::user("q1"));
        conv.push(Message::assistant_with_actions("", vec![request("a")]));
        conv.push(Message::tool(ActionResult::success(&request("a"), "ok")));
        conv.push(Message::assistant("a1"));
        conv.push(Message::user("q2"));
        conv.push(Message::assistant("a2"));

        // 最近 3 条从 tool 结果开始，应前推到 q2
        let dropped = conv.prune_to(3);
        assert_eq!(dropped, 4);
        assert_eq!(conv.messages()[0], Message::user("q2"));
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_prune_without_user_boundary_keeps_all() {
        let mut conv = Conversation::new("c");
        conv.push(Message::user("q"));
        for i in 0..4 {
            conv.push(Message::assistant(format!("a{i}")));
        }
        assert_eq!(conv.prune_to(2), 0);
        assert_eq!(conv.len(), 5);
    }

    #[tokio::test]
    async fn test_store_get_or_create_and_clear() {
        let store = ConversationStore::new();
        let a = store.get_or_create("a");
        a.lock().await.push(Message::user("hi"));
        let again = store.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(store.snapshot("a").await.unwrap().len(), 1);
        assert!(store.snapshot("missing").await.is_none());
        drop((a, again));
        assert!(store.clear("a").await);
        assert!(!store.clear("a").await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clear_waits_for_holder_and_keeps_queued_entry() {
        let store = Arc::new(ConversationStore::new());
        let held = store.get_or_create("a");
        let mut guard = held.lock().await;
        guard.push(Message::user("in flight"));

        let clearing = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.clear("a").await })
        };
        tokio::task::yield_now().await;
        assert!(!clearing.is_finished());

        guard.push(Message::assistant("done"));
        drop(guard);
        assert!(clearing.await.unwrap());

        // 仍被持有，所以留在 map 中，但已清空
        let again = store.get_or_create("a");
        assert!(Arc::ptr_eq(&held, &again));
        assert!(again.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used_idle_conversation() {
        let store = ConversationStore::new().with_max_conversations(2);
        let busy = store.get_or_create("busy");
        tokio::time::advance(Duration::from_secs(1)).await;
        store.get_or_create("old");
        tokio::time::advance(Duration::from_secs(1)).await;
        store.get_or_create("new");

        // busy 最旧但被持有，淘汰的是 old
        assert_eq!(store.len(), 2);
        assert!(store.snapshot("old").await.is_none());
        assert!(store.snapshot("busy").await.is_some());
        assert!(store.snapshot("new").await.is_some());
        drop(busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_spares_held_and_recent_conversations() {
        let store = ConversationStore::new();
        let held = store.get_or_create("held");
        store.get_or_create("stale");
        tokio::time::advance(Duration::from_secs(120)).await;
        store.get_or_create("fresh");
        store.touch("held");
        store.get_or_create("stale-too");
        tokio::time::advance(Duration::from_secs(120)).await;
        store.touch("fresh");

        assert_eq!(store.evict_idle(Duration::from_secs(60)), 2);
        assert_eq!(store.len(), 2);
        assert!(store.snapshot("fresh").await.is_some());
        assert!(store.snapshot("held").await.is_some());
        drop(held);
        assert_eq!(store.evict_idle(Duration::from_secs(60)), 1);
    }
}
