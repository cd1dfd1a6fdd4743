/// Completes on the first termination signal.
///
/// On Unix these are Ctrl-C (SIGINT) and SIGTERM,
/// on Windows Ctrl-C, Ctrl-Close and Ctrl-Shutdown.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let terminate = async {
			let mut signal =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			signal.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = terminate => {}
		}
	}

	#[cfg(windows)]
	{
		let ctrl_close = async {
			let mut signal = tokio::signal::windows::ctrl_close()?;
			signal.recv().await;
			std::io::Result::Ok(())
		};
		let ctrl_shutdown = async {
			let mut signal = tokio::signal::windows::ctrl_shutdown()?;
			signal.recv().await;
			std::io::Result::Ok(())
		};
		tokio::select! {
			_ = ctrl_c => {},
			_ = ctrl_close => {},
			_ = ctrl_shutdown => {},
		}
	}
}
