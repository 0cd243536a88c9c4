use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use webview_bridge::bridge::{DescriptorBuilder, ExposedObject, ValueCell, ValueFlags};
use webview_bridge::{BridgeConfig, QuickJsSurface, WebviewBridge, WebviewSurface};

const DEMO_PAGE: &str = r#"<!doctype html>
<html>
  <body>
    <script>
      (async () => {
        await Test.ringBell();
        console.log('count is', await Test.count);
        console.log(await Test.greet('bridge'));
        Bridge.__internal.mutate(Test.__internal.id, 'variable', (value) => {
          console.log('variable is now', value);
        });
      })();
    </script>
  </body>
</html>
"#;

/// Object exposed to the demo page as `window.Test`.
struct Test {
    count: ValueCell<i32>,
    variable: ValueCell<i32>,
}

impl ExposedObject for Test {
    fn describe(desc: &mut DescriptorBuilder<Self>) {
        desc.value("count", |test| &test.count)
            .value_with(
                "variable",
                |test| &test.variable,
                ValueFlags::default().watched(),
            )
            .function("ringBell", |test, (): ()| {
                let count = test.count.update(|count| {
                    *count += 1;
                    *count
                });
                tracing::info!(target: "demo", ?count, "ring ring");
                Ok(())
            })
            .function("greet", |_, (name,): (String,)| Ok(format!("Hello, {name}!")));
    }
}

fn main() -> Result<()> {
    let config = BridgeConfig::from_env().unwrap_or_else(|err| {
        eprintln!("Failed to load bridge configuration: {err}. Using defaults.");
        BridgeConfig::default()
    });

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_target(false)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let _guard = rt.enter();

    let surface = Arc::new(rt.block_on(QuickJsSurface::start(config.console_capacity))?);
    let bridge = WebviewBridge::new(Arc::clone(&surface) as Arc<dyn WebviewSurface>, &config)?;

    let test = Arc::new(Test {
        count: ValueCell::new(0),
        variable: ValueCell::new(123),
    });
    bridge.define_object("Test", Arc::clone(&test))?;

    match std::env::args().nth(1) {
        Some(target) if Path::new(&target).is_file() => {
            let html = std::fs::read_to_string(&target)
                .with_context(|| format!("failed to read {target}"))?;
            surface.set_html(&html)?;
        }
        Some(target) => surface.navigate(&target)?,
        None => surface.set_html(DEMO_PAGE)?,
    }

    {
        let surface = Arc::clone(&surface);
        let test = Arc::clone(&test);
        rt.spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            test.variable.set(456);
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = surface.close();
        });
    }

    surface.run()?;
    bridge.close();

    for message in surface.console_messages() {
        println!("[{}] {}", message.level, message.text);
    }
    Ok(())
}
