fn main() {
	if let Err(err) = authgate_app::run() {
		eprintln!("ERROR: {err:#}");
		std::process::exit(1);
	}
}
