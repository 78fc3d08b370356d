use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use crate::core::error::{Error, FetchResult};

/// 流式消费者：收到的每个数据块直接交给它，不做缓冲
pub type StreamConsumer = Arc<dyn Fn(Bytes) + Send + Sync>;

/// 数据任务的状态：缓冲与流式二选一，挂载后不可切换
#[derive(Default)]
pub struct DataDelegate {
    buffer: BytesMut,
    stream: Option<StreamConsumer>,
    /// 任意一次尝试收到过数据，重试时不清除
    delivered: bool,
}

impl DataDelegate {
    pub(crate) fn new(stream: Option<StreamConsumer>) -> Self {
        Self { buffer: BytesMut::new(), stream, delivered: false }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// 已缓冲的数据；流式模式下始终为 None
    pub fn data(&self) -> Option<Bytes> {
        if self.stream.is_some() {
            return None;
        }
        Some(Bytes::copy_from_slice(&self.buffer))
    }

    /// 只有在整个请求尚未收到任何数据、且未挂载过消费者时才允许挂载
    pub(crate) fn attach_stream(&mut self, consumer: StreamConsumer, received: u64) -> FetchResult<()> {
        if self.stream.is_some() || self.delivered || received > 0 {
            return Err(Error::StreamAttach);
        }
        self.stream = Some(consumer);
        Ok(())
    }

    /// 缓冲模式追加数据并返回 None；流式模式返回需要在锁外调用的消费者
    pub(crate) fn did_receive_data(&mut self, chunk: &Bytes) -> Option<StreamConsumer> {
        self.delivered = true;
        match &self.stream {
            Some(consumer) => Some(consumer.clone()),
            None => {
                self.buffer.extend_from_slice(chunk);
                None
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_buffers_chunks_in_order() {
        let mut delegate = DataDelegate::new(None);
        for chunk in ["he", "llo", " ", "world"] {
            assert!(delegate.did_receive_data(&Bytes::from(chunk)).is_none());
        }
        assert_eq!(delegate.data().unwrap().as_ref(), b"hello world");

        delegate.reset();
        assert_eq!(delegate.data().unwrap().len(), 0);
    }

    #[test]
    fn test_streaming_never_buffers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer: StreamConsumer = Arc::new(move |chunk| sink.lock().unwrap().push(chunk));
        let mut delegate = DataDelegate::new(Some(consumer));

        let chunk = Bytes::from_static(b"abc");
        let consumer = delegate.did_receive_data(&chunk).expect("流式模式应返回消费者");
        consumer(chunk);
        assert!(delegate.data().is_none());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_attach_rejected_after_bytes_or_twice() {
        let consumer: StreamConsumer = Arc::new(|_| {});

        let mut delegate = DataDelegate::new(None);
        delegate.did_receive_data(&Bytes::from_static(b"x"));
        assert!(matches!(delegate.attach_stream(consumer.clone(), 1), Err(Error::StreamAttach)));

        let mut delegate = DataDelegate::new(None);
        assert!(delegate.attach_stream(consumer.clone(), 0).is_ok());
        assert!(matches!(delegate.attach_stream(consumer, 0), Err(Error::StreamAttach)));
    }

    #[test]
    fn test_attach_rejected_after_earlier_attempt_buffered() {
        let consumer: StreamConsumer = Arc::new(|_| {});
        let mut delegate = DataDelegate::new(None);
        delegate.did_receive_data(&Bytes::from_static(b"first"));
        delegate.reset();

        assert_eq!(delegate.data().unwrap().len(), 0);
        assert!(matches!(delegate.attach_stream(consumer, 0), Err(Error::StreamAttach)));
        assert!(!delegate.is_streaming());
    }
}
