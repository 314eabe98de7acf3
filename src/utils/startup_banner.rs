use crate::config::AppConfig;

const RESET: &str = "\x1b[0m";
const BANNER_COLOR: &str = "\x1b[38;5;66m";
const DIM_GRAY: &str = "\x1b[2;90m";
const BANNER: &str = r#"
                       _ _
  _ __ ___   ___  __| (_) __ _  __ _ _   _  ___ _   _  ___
 | '_ ` _ \ / _ \/ _` | |/ _` |/ _` | | | |/ _ \ | | |/ _ \
 | | | | | |  __/ (_| | | (_| | (_| | |_| |  __/ |_| |  __/
 |_| |_| |_|\___|\__,_|_|\__,_|\__, |\__,_|\___|\__,_|\___|
                                  |_|"#;
const APP_DESCRIPTION: &str =
    "Persistent command lanes for media imports over a ban-aware metadata connection.";
const LIABILITY_NOTICE: &str =
    "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

pub fn render_startup_banner(config: &AppConfig) -> String {
    let udp = if config.udp.enabled {
        format!(
            "udp {}:{} (local port {})",
            config.udp.remote_host, config.udp.remote_port, config.udp.local_port
        )
    } else {
        "udp disabled".to_owned()
    };
    let http = if config.http.enabled {
        format!("http {}", config.http.base_url)
    } else {
        "http disabled".to_owned()
    };

    let mut rendered = String::new();
    rendered.push_str(&format!("{BANNER_COLOR}{BANNER}{RESET}\n"));
    rendered.push_str(&format!(
        "{} v{} | build {}\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("MEDIAQUEUE_BUILD_DATE_UTC")
    ));
    rendered.push_str(APP_DESCRIPTION);
    rendered.push('\n');
    rendered.push_str(&format!(
        "storage {} | {udp} | {http}\n",
        config.storage.engine
    ));
    rendered.push_str(&format!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}\n"));
    rendered.push_str("\n================================================================\n");
    rendered
}

pub fn print_startup_banner(config: &AppConfig) {
    println!("{}", render_startup_banner(config));
}
