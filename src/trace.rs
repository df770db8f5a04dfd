pub fn init(color: bool, levels: &str) {
    tracing_subscriber::fmt()
        .with_ansi(color)
        .with_writer(std::io::stderr)
        .with_env_filter(levels)
        .init();
}
