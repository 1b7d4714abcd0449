#[allow(unused)] // used in tests
pub fn init_default_logging() {
    pamlib::util::log_util::init();
}
