//! Defaults and header names shared by the server and the CLI.

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8888;

pub const CLIENT_ID_HEADER: &str = "client-id";
pub const PLACE_ID_HEADER: &str = "place-id";
/// Older companions send the place id under this name.
pub const LEGACY_PLACE_ID_HEADER: &str = "roblox-id";

pub const PROJECTS_ROUTE: &str = "/projects";

pub fn bind_address(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}
