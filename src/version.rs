/// Release builds stamp `APP_VERSION`; local builds report the crate version.
pub const VERSION: &str = match option_env!("APP_VERSION") {
    Some(stamped) => stamped,
    None => env!("CARGO_PKG_VERSION"),
};
