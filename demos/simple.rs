use std::time::Duration;

use flagsync::{Config, Subject};

pub fn main() -> flagsync::Result<()> {
    env_logger::init();

    let sdk_key = std::env::var("FLAGSYNC_SDK_KEY").unwrap();
    let mut client = Config::from_sdk_key(sdk_key).to_client();

    // Connect to the stream in the background.
    client.start()?;

    // Until flag data arrives, every evaluation serves the default value.
    if let Some(Err(err)) = client.wait_for_initialization(Duration::from_secs(10)) {
        eprintln!("failed to initialize: {err}");
    }

    let subject = Subject::new("test-subject").with_attribute("country", "US");
    let detail = client.variation_detail("a-boolean-flag", &subject, false.into());

    println!("Assignment: {:?} ({:?})", detail.value, detail.reason);

    client.close()
}
