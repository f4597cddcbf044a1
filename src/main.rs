fn main() {
    if let Err(e) = mcrun::run() {
        eprintln!("mcrun: {e:#}");
        std::process::exit(1);
    }
}
