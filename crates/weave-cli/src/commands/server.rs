//! `weave server`: start the HTTP server.

pub async fn run(
    host: String,
    port: u16,
    db_path: String,
    config_path: Option<String>,
) -> Result<(), String> {
    let engine_config = super::load_config(config_path.as_deref())?;
    let config = weave_server::ServerConfig {
        host: host.clone(),
        port,
        db_path,
        config_path,
    };

    println!("Starting Weave server on {}:{}...", host, port);

    let state = weave_server::create_app_state(&config.db_path, engine_config).await?;
    let addr = weave_server::start_server_with_state(config, state.clone()).await?;
    println!("Weave server listening on http://{}", addr);

    // Keep the process running until interrupted
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down...");
    state.shutdown().await;
    Ok(())
}
