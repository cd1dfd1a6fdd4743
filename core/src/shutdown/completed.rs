use std::{
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex},
	task::{Context, Poll},
};

use super::{lock, register, ControllerInner};

/// Resolves with the shutdown reason once a shutdown was triggered
/// and every delay token has been dropped.
pub struct Completed<T: Clone> {
	pub(crate) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = lock(&self.inner);
		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}

		register(&mut inner.on_shutdown_complete, cx.waker());
		Poll::Pending
	}
}
