pub fn run() -> anyhow::Result<()> {
    println!("kube-rbac-watch {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
