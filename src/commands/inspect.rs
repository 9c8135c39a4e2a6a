// Read-only commands: check, devices, effects

use std::path::Path;

use anyhow::Result;
use openrgb_client::DeviceClient;
use rgbhook::config::HookPlan;
use rgbhook::trigger::condition;
use rgbhook::{Config, EffectLibrary, Trigger};
use serde_json::json;

use super::{connect_client, ServerArgs};

fn describe_trigger(trigger: &Trigger) -> String {
    let mut text = trigger.source().describe();
    for c in trigger.conditions() {
        text.push_str(&format!("\n      if {}", condition::describe(c)));
    }
    text
}

fn describe_actions(plan: &HookPlan) -> Vec<String> {
    plan.action.kinds().iter().map(|k| k.describe()).collect()
}

/// Validate a configuration and list what it would run
pub fn check(config: &Config, json: bool) -> Result<()> {
    let library = config.effect_library()?;
    let plans = config.plans(&library)?;

    if json {
        let hooks: Vec<_> = plans
            .iter()
            .map(|plan| {
                json!({
                    "name": plan.name,
                    "bus": plan.scope.name(),
                    "trigger": plan.start.source().describe(),
                    "trigger_conditions": plan.start.conditions().len(),
                    "until": plan.end.source().describe(),
                    "until_conditions": plan.end.conditions().len(),
                    "actions": describe_actions(plan),
                })
            })
            .collect();
        let out = json!({
            "version": config.version,
            "animation_hz": config.animation.frequency,
            "hooks": hooks,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "Configuration {} is valid: {} hook(s)",
        config.version,
        plans.len()
    );
    for plan in &plans {
        println!("  {} [{}]", plan.name, plan.scope);
        println!("    trigger: {}", describe_trigger(&plan.start));
        println!("    until:   {}", describe_trigger(&plan.end));
        let actions = describe_actions(plan);
        if actions.is_empty() {
            println!("    actions: (none)");
        } else {
            println!("    actions: {}", actions.join("; "));
        }
    }
    Ok(())
}

/// List devices reported by the OpenRGB server
pub async fn devices(server: &ServerArgs, json: bool) -> Result<()> {
    let client = connect_client(&server.resolve(None)).await?;
    let devices = client.devices().await?;

    if json {
        let out: Vec<_> = devices
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "name": d.name,
                    "leds": d.led_count(),
                    "zones": d.zones.iter().map(|z| json!({
                        "name": z.name,
                        "start": z.start,
                        "len": z.len,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices reported by the server");
        return Ok(());
    }
    for d in &devices {
        println!("{:>3}  {} ({} LEDs)", d.id, d.name, d.led_count());
        for z in &d.zones {
            println!("       zone {:<20} {}..{}", z.name, z.start, z.start + z.len);
        }
    }
    Ok(())
}

/// List the effect library
pub fn effects(file: Option<&Path>, json: bool) -> Result<()> {
    let mut library = EffectLibrary::builtin();
    if let Some(path) = file {
        library.extend(EffectLibrary::load(path)?);
    }

    if json {
        let out: Vec<_> = library
            .effects
            .iter()
            .map(|(name, def)| {
                json!({
                    "name": name,
                    "variables": def.variables(),
                    "animated": def.is_animated(),
                    "description": def.description,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for (name, def) in &library.effects {
        let vars = def.variables();
        let vars = if vars.is_empty() {
            String::new()
        } else {
            format!(
                " [{}]",
                vars.iter().map(|v| format!("${v}")).collect::<Vec<_>>().join(", ")
            )
        };
        println!(
            "  {name:<12}{vars}  {}",
            def.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
