mod async_deque;
pub use async_deque::ArcAsyncDeque;
