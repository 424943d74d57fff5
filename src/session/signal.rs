//! 客户端连接信号
//!
//! 把 HTTP 适配层观察到的请求/响应终止事件抽象为一次性信号，
//! 核心据此在排队阶段放弃等待、在执行阶段自动释放槽位。
//! 首个终止事件生效，后续事件被忽略。

use tokio::sync::watch;

/// 终止事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// 请求连接关闭
    RequestClose,
    /// 请求被中止
    RequestAborted,
    /// 响应连接关闭
    ResponseClose,
    /// 响应正常写完
    ResponseFinish,
    /// 响应出错
    ResponseError,
}

impl ClientEvent {
    /// 是否属于客户端断开（而非正常完成）
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::RequestClose | Self::RequestAborted | Self::ResponseClose
        )
    }
}

impl std::fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequestClose => "request-close",
            Self::RequestAborted => "request-aborted",
            Self::ResponseClose => "response-close",
            Self::ResponseFinish => "response-finish",
            Self::ResponseError => "response-error",
        };
        f.write_str(s)
    }
}

/// 一次性客户端信号
///
/// 适配层为每个入站请求创建一个并注册到框架的连接事件上；
/// 核心只读不写（测试除外）。
#[derive(Debug, Clone)]
pub struct ClientSignal {
    tx: watch::Sender<Option<ClientEvent>>,
}

impl Default for ClientSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// 触发终止事件，仅首个事件生效
    pub fn fire(&self, event: ClientEvent) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(event);
                true
            } else {
                false
            }
        });
    }

    /// 已触发的事件（未触发时返回 None）
    pub fn fired(&self) -> Option<ClientEvent> {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> ClientWatch {
        ClientWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// 信号的观察端
#[derive(Debug, Clone)]
pub struct ClientWatch {
    rx: watch::Receiver<Option<ClientEvent>>,
}

impl ClientWatch {
    /// 等待终止事件
    ///
    /// 信号端整体被丢弃时按连接关闭处理，保证等待方总能退出。
    pub async fn terminal(&mut self) -> ClientEvent {
        match self.rx.wait_for(|v| v.is_some()).await {
            Ok(value) => value.unwrap_or(ClientEvent::RequestClose),
            Err(_) => ClientEvent::RequestClose,
        }
    }
}
