//! Service-control boundary.
//!
//! The agent runs the same core in two mount modes: a plain console
//! process (Ctrl-C to stop) or a Windows service. Registration with the
//! service control manager goes through `sc.exe`; the heavy lifting stays
//! in the orchestrator either way.

use std::process::Command;

pub const SERVICE_NAME: &str = "ClassGuardAgent";

/// Handle a service-control verb from the command line. Returns false when
/// the argument is not a verb and normal startup should continue.
pub fn handle_control_verb(verb: &str) -> bool {
    let args: Vec<String> = match verb {
        "install" => {
            let exe = std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "classguard-agent.exe".to_string());
            vec![
                "create".to_string(),
                SERVICE_NAME.to_string(),
                format!("binPath= {}", exe),
                "start= auto".to_string(),
            ]
        }
        "uninstall" => vec!["delete".to_string(), SERVICE_NAME.to_string()],
        "start" => vec!["start".to_string(), SERVICE_NAME.to_string()],
        "stop" => vec!["stop".to_string(), SERVICE_NAME.to_string()],
        _ => return false,
    };

    match Command::new("sc.exe").args(&args).output() {
        Ok(output) if output.status.success() => {
            println!("{} {}: ok", SERVICE_NAME, verb);
        }
        Ok(output) => {
            eprintln!(
                "{} {} failed: {}",
                SERVICE_NAME,
                verb,
                String::from_utf8_lossy(&output.stdout).trim()
            );
        }
        Err(e) => eprintln!("sc.exe unavailable: {}", e),
    }
    true
}

/// Best-effort detection of the service environment: services have no
/// interactive console attached.
pub fn is_service_environment() -> bool {
    std::env::var("TERM").is_err() && std::env::var("PROMPT").is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_verbs_fall_through_to_normal_startup() {
        assert!(!handle_control_verb("--debug"));
        assert!(!handle_control_verb("--config"));
        assert!(!handle_control_verb(""));
    }
}
