/// Prints the CLI's own version, as reported by `CARGO_PKG_VERSION`.
pub fn run() {
    println!("taspctl {}", env!("CARGO_PKG_VERSION"));
}
