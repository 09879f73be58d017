fn main() {
    if let Err(e) = memos::run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
