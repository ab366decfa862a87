use anyhow::{Context, Result, bail};
use std::io::BufRead;

use kids_guard::config::EnginePaths;
use kids_guard::events::EnforcementEvent;
use kids_guard::ipc::ControlClient;
use kids_guard::lock::PinOutcome;
use kids_guard::process::{ControlResponse, ProcessCommand, ProcessStatus, ScreenTimeReport};
use kids_guard::screen_time::LimitStatus;
use kids_guard::target::TargetKind;

use crate::cli::{Commands, PinCommands, ScreenTimeCommands, SettingCommands};

use super::utils::format_seconds;

/// Send a command to the running process and print the result
pub fn run_control_command(command: Commands, paths: &EnginePaths) -> Result<()> {
    let client = ControlClient::new(paths.socket_path());
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    runtime.block_on(async {
        match command {
            Commands::Run { .. } => bail!("`run` is not a control command"),
            Commands::Brightness { command } => {
                setting(&client, TargetKind::Brightness, command).await
            }
            Commands::Volume { command } => setting(&client, TargetKind::Volume, command).await,
            Commands::ScreenTime { command } => screen_time(&client, command).await,
            Commands::Pin { command } => pin(&client, command).await,
            Commands::Unlock { pin } => unlock(&client, pin).await,
            Commands::Emergency => {
                expect_ack(request(&client, ProcessCommand::EmergencyCall).await?)?;
                println!("✓ Emergency call started");
                Ok(())
            }
            Commands::Status => {
                let status = status(&client).await?;
                print_status(&status);
                Ok(())
            }
            Commands::Events => follow_events(&client).await,
            Commands::Shutdown => {
                expect_ack(request(&client, ProcessCommand::Shutdown).await?)?;
                println!("✓ Kids Guard stopped");
                Ok(())
            }
        }
    })
}

async fn request(client: &ControlClient, command: ProcessCommand) -> Result<ControlResponse> {
    match client.request(&command).await? {
        ControlResponse::Error { code, message } => bail!("{} ({})", message, code),
        response => Ok(response),
    }
}

fn expect_ack(response: ControlResponse) -> Result<()> {
    match response {
        ControlResponse::Ack => Ok(()),
        other => bail!("Unexpected response: {:?}", other),
    }
}

fn expect_percent(response: ControlResponse) -> Result<u8> {
    match response {
        ControlResponse::Percent { percent } => Ok(percent),
        other => bail!("Unexpected response: {:?}", other),
    }
}

async fn status(client: &ControlClient) -> Result<ProcessStatus> {
    match request(client, ProcessCommand::Status).await? {
        ControlResponse::Status(status) => Ok(status),
        other => bail!("Unexpected response: {:?}", other),
    }
}

async fn setting(client: &ControlClient, kind: TargetKind, command: SettingCommands) -> Result<()> {
    let brightness = kind == TargetKind::Brightness;

    match command {
        SettingCommands::Set { percent } => {
            let command = if brightness {
                ProcessCommand::SetBrightness { percent }
            } else {
                ProcessCommand::SetVolume { percent }
            };
            let applied = expect_percent(request(client, command).await?)?;
            println!("✓ {} set to {}%", kind, applied);
        }
        SettingCommands::Get => {
            let command = if brightness {
                ProcessCommand::GetBrightness
            } else {
                ProcessCommand::GetVolume
            };
            println!("{}: {}%", kind, expect_percent(request(client, command).await?)?);
        }
        SettingCommands::Enforce { percent, store_only } => {
            let enforcing = !store_only;
            let command = if brightness {
                ProcessCommand::UpdateBrightness { value: percent, enforcing }
            } else {
                ProcessCommand::UpdateVolume { value: percent, enforcing }
            };
            expect_ack(request(client, command).await?)?;
            if enforcing {
                println!("✓ Enforcing {} at {}%", kind, kind.clamp(percent));
            } else {
                println!("✓ Stored {} target {}%", kind, kind.clamp(percent));
            }
        }
        SettingCommands::Release => {
            let command = if brightness {
                ProcessCommand::StopBrightness
            } else {
                ProcessCommand::StopVolume
            };
            expect_ack(request(client, command).await?)?;
            println!("✓ {} released", kind);
        }
        SettingCommands::Status => {
            let status = status(client).await?;
            let target = if brightness {
                status.brightness_target
            } else {
                status.volume_target
            };
            match target {
                Some(percent) => println!("{}: enforced at {}%", kind, percent),
                None => println!("{}: not enforced", kind),
            }
        }
    }

    Ok(())
}

async fn screen_time(client: &ControlClient, command: ScreenTimeCommands) -> Result<()> {
    match command {
        ScreenTimeCommands::Enforce(limit) => {
            let limit_seconds = limit.limit_seconds();
            expect_ack(
                request(
                    client,
                    ProcessCommand::UpdateScreenTime {
                        limit_seconds,
                        enforcing: true,
                    },
                )
                .await?,
            )?;
            println!("✓ Screen time limited to {}", format_seconds(limit_seconds));
        }
        ScreenTimeCommands::Release => {
            expect_ack(request(client, ProcessCommand::StopScreenTime).await?)?;
            println!("✓ Screen time limit removed");
        }
        ScreenTimeCommands::Status => match request(client, ProcessCommand::GetScreenTime).await? {
            ControlResponse::ScreenTime(report) => print_screen_time(&report),
            other => bail!("Unexpected response: {:?}", other),
        },
    }

    Ok(())
}

async fn pin(client: &ControlClient, command: PinCommands) -> Result<()> {
    match command {
        PinCommands::Set { pin } => {
            expect_ack(request(client, ProcessCommand::SavePin { pin }).await?)?;
            println!("✓ Parent PIN saved");
        }
        PinCommands::Change { old, new } => {
            expect_ack(request(client, ProcessCommand::ChangePin { old, new }).await?)?;
            println!("✓ Parent PIN changed");
        }
    }
    Ok(())
}

async fn unlock(client: &ControlClient, pin: Option<String>) -> Result<()> {
    let pin = match pin {
        Some(pin) => pin,
        None => {
            eprint!("Parent PIN: ");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read PIN")?;
            line.trim().to_string()
        }
    };

    match request(client, ProcessCommand::VerifyPin { pin }).await? {
        ControlResponse::Pin {
            outcome: PinOutcome::Unlocked,
        } => {
            println!("✓ Unlocked");
            Ok(())
        }
        ControlResponse::Pin {
            outcome: PinOutcome::EmptyPin,
        } => bail!("Please enter PIN"),
        ControlResponse::Pin {
            outcome: PinOutcome::Rejected,
        } => bail!("Incorrect PIN"),
        other => bail!("Unexpected response: {:?}", other),
    }
}

async fn follow_events(client: &ControlClient) -> Result<()> {
    let mut events = client.subscribe().await?;
    println!("Watching enforcement events (Ctrl+C to stop)");

    while let Some(event) = events.next().await? {
        println!("{}", describe_event(&event));
    }

    println!("Kids Guard stopped");
    Ok(())
}

fn describe_event(event: &EnforcementEvent) -> String {
    let time = chrono::Local::now().format("%H:%M:%S");
    match event {
        EnforcementEvent::BrightnessEnforced { from, to } => {
            format!("[{}] brightness corrected {}% -> {}%", time, from, to)
        }
        EnforcementEvent::VolumeEnforced { from, to } => {
            format!("[{}] volume corrected {}% -> {}%", time, from, to)
        }
        EnforcementEvent::ScreenTimeWarning { minutes_remaining } => {
            format!("[{}] {} minute(s) of screen time left", time, minutes_remaining)
        }
        EnforcementEvent::LockEngaged { presentation } => {
            format!("[{}] locked ({:?})", time, presentation)
        }
        EnforcementEvent::Unlocked { reason } => format!("[{}] unlocked ({:?})", time, reason),
    }
}

fn print_status(status: &ProcessStatus) {
    println!("Kids Guard Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("PID:          {}", status.pid);
    println!(
        "Running since: {}",
        status
            .started_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S %Z")
    );
    println!();

    let percent = |target: Option<u8>| match target {
        Some(p) => format!("{}%", p),
        None => "not enforced".to_string(),
    };
    println!("Brightness:   {}", percent(status.brightness_target));
    println!("Volume:       {}", percent(status.volume_target));
    match status.screen_time_limit {
        Some(limit) => println!("Screen time:  limit {}", format_seconds(limit)),
        None => println!("Screen time:  not enforced"),
    }

    println!(
        "Parent PIN:   {}",
        if status.pin_set { "set" } else { "not set" }
    );

    println!();
    match status.presentation {
        Some(presentation) if status.locked => {
            println!("Session:      LOCKED ({:?})", presentation)
        }
        _ => println!("Session:      unlocked"),
    }
}

fn print_screen_time(report: &ScreenTimeReport) {
    println!("Limit:    {}", format_seconds(report.limit_seconds));
    println!("Used:     {}", format_seconds(report.elapsed_seconds));
    match report.limit {
        LimitStatus::Inactive => println!("Status:   not enforced"),
        LimitStatus::Within { remaining, .. } => {
            println!("Status:   {} remaining", format_seconds(remaining))
        }
        LimitStatus::Exceeded { .. } => println!("Status:   limit reached"),
    }
}
