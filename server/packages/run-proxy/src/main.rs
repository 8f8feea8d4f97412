fn main() {
    if let Err(err) = run_proxy::cli::run_proxy() {
        tracing::error!(error = %err, "run-proxy failed");
        std::process::exit(1);
    }
}
