//! Cooperative shutdown shared between the network event loop, the
//! discovery orchestrator and the signal handler.
//!
//! Any task can trigger a shutdown with a reason. Tasks wrapped with
//! [`Controller::with_cancel`] are cancelled once that happens, and
//! [`Controller::completed_shutdown`] resolves after every outstanding
//! [`DelayToken`] has been dropped.
use std::{
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	task::{Context, Poll, Waker},
};

mod completed;
mod utils;

pub use completed::Completed;
pub use utils::user_signal;

pub struct ControllerInner<T> {
	pub(crate) reason: Option<T>,
	pub(crate) delay_tokens: usize,
	pub(crate) on_shutdown_triggered: Vec<Waker>,
	pub(crate) on_shutdown_complete: Vec<Waker>,
}

impl<T> ControllerInner<T> {
	fn wake_all(wakers: &mut Vec<Waker>) {
		for waker in wakers.drain(..) {
			waker.wake();
		}
	}
}

pub(crate) fn lock<T>(inner: &Mutex<ControllerInner<T>>) -> MutexGuard<'_, ControllerInner<T>> {
	inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
	if !wakers.iter().any(|registered| registered.will_wake(waker)) {
		wakers.push(waker.clone());
	}
}

/// Returned when a shutdown has already been triggered.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownHasStarted<T> {
	pub reason: T,
}

#[derive(Clone)]
pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(ControllerInner {
				reason: None,
				delay_tokens: 0,
				on_shutdown_triggered: Vec::new(),
				on_shutdown_complete: Vec::new(),
			})),
		}
	}

	/// Starts the shutdown. Only the first reason is kept.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		let mut inner = lock(&self.inner);
		if let Some(reason) = inner.reason.as_ref() {
			return Err(ShutdownHasStarted {
				reason: reason.clone(),
			});
		}
		inner.reason = Some(reason);
		ControllerInner::<T>::wake_all(&mut inner.on_shutdown_triggered);
		if inner.delay_tokens == 0 {
			ControllerInner::<T>::wake_all(&mut inner.on_shutdown_complete);
		}
		Ok(())
	}

	pub fn is_shutdown_triggered(&self) -> bool {
		lock(&self.inner).reason.is_some()
	}

	pub fn shutdown_reason(&self) -> Option<T> {
		lock(&self.inner).reason.clone()
	}

	/// Future that resolves with the reason once a shutdown is triggered.
	pub fn triggered_shutdown(&self) -> Triggered<T> {
		Triggered {
			inner: self.inner.clone(),
		}
	}

	/// Future that resolves once a shutdown is triggered and all delay tokens are dropped.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Holding a token postpones [`Controller::completed_shutdown`].
	pub fn delay_token(&self) -> Result<DelayToken<T>, ShutdownHasStarted<T>> {
		let mut inner = lock(&self.inner);
		if let Some(reason) = inner.reason.as_ref() {
			return Err(ShutdownHasStarted {
				reason: reason.clone(),
			});
		}
		inner.delay_tokens += 1;
		Ok(DelayToken {
			inner: self.inner.clone(),
		})
	}

	/// Runs the future until it completes or a shutdown is triggered,
	/// whichever comes first.
	pub fn with_cancel<F>(&self, future: F) -> impl Future<Output = Result<F::Output, T>>
	where
		F: Future,
	{
		let triggered = self.triggered_shutdown();
		async move {
			tokio::select! {
				biased;
				reason = triggered => Err(reason),
				output = future => Ok(output),
			}
		}
	}

	/// Triggers a shutdown with the given reason once the future completes.
	pub fn with_trigger<F>(&self, reason: T, future: F) -> impl Future<Output = F::Output>
	where
		F: Future,
	{
		let controller = self.clone();
		async move {
			let output = future.await;
			_ = controller.trigger_shutdown(reason);
			output
		}
	}

	/// Triggers a shutdown when the user sends a termination signal.
	pub fn on_user_signal(&self, reason: T) -> impl Future<Output = ()> {
		let controller = self.clone();
		async move {
			user_signal().await;
			_ = controller.trigger_shutdown(reason);
		}
	}
}

pub struct Triggered<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Triggered<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = lock(&self.inner);
		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}
		register(&mut inner.on_shutdown_triggered, cx.waker());
		Poll::Pending
	}
}

pub struct DelayToken<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Drop for DelayToken<T> {
	fn drop(&mut self) {
		let mut inner = lock(&self.inner);
		inner.delay_tokens -= 1;
		if inner.delay_tokens == 0 && inner.reason.is_some() {
			ControllerInner::<T>::wake_all(&mut inner.on_shutdown_complete);
		}
	}
}
