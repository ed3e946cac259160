use plate_scribe::{cli::Cli, init_logging, plate_scribe_service};
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let mut args = Cli::from_config_and_args()?;
    let _guard = init_logging(args.log_level, &mut args.log_path)?;
    args.print_config();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let (plate_scribe_future, cancellation_token) = plate_scribe_service(args);

    let ctrl_c_token = cancellation_token.clone();
    rt.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down server"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        ctrl_c_token.cancel();
    });

    rt.block_on(async {
        if let Err(e) = plate_scribe_future.await {
            error!("Service failed: {:#}", e);
            return Err(e);
        }
        info!("Server stopped");
        Ok(())
    })
}
