//! Windows implementation of the platform contract.
//!
//! Process enumeration and termination go through sysinfo, which opens
//! handles with the minimum rights for each operation. The console session
//! query and the token privilege adjustment have no sysinfo equivalent and
//! shell out to PowerShell instead.

use std::process::Command;

use parking_lot::Mutex;
use sysinfo::{Pid, System};

use super::{Platform, PlatformError, ProcessRecord};

pub struct WindowsPlatform {
    // sysinfo wants &mut for refreshes; the adapter itself stays Sync.
    sys: Mutex<System>,
}

impl WindowsPlatform {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for WindowsPlatform {
    fn enumerate_processes(&self) -> Result<Vec<ProcessRecord>, PlatformError> {
        let mut sys = self.sys.lock();
        sys.refresh_processes();

        let records = sys
            .processes()
            .iter()
            .map(|(pid, process)| ProcessRecord {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                image_path: process.exe().map(|p| p.display().to_string()),
            })
            .collect();
        Ok(records)
    }

    fn resolve_image_path(&self, pid: u32) -> Option<String> {
        let mut sys = self.sys.lock();
        let pid = Pid::from_u32(pid);
        if !sys.refresh_process(pid) {
            return None;
        }
        sys.process(pid)
            .and_then(|p| p.exe())
            .map(|p| p.display().to_string())
    }

    fn terminate(&self, pid: u32) -> Result<(), PlatformError> {
        let mut sys = self.sys.lock();
        let pid = Pid::from_u32(pid);
        if !sys.refresh_process(pid) {
            return Err(PlatformError::Transient(format!(
                "process {} already exited",
                pid
            )));
        }

        match sys.process(pid) {
            Some(process) if process.kill() => Ok(()),
            Some(_) => Err(PlatformError::Denied(format!(
                "terminate refused for PID {}",
                pid
            ))),
            None => Err(PlatformError::Transient(format!(
                "process {} already exited",
                pid
            ))),
        }
    }

    fn active_console_user(&self) -> Result<String, PlatformError> {
        let output = Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "(Get-CimInstance -ClassName Win32_ComputerSystem).UserName",
            ])
            .output()
            .map_err(|e| PlatformError::Transient(format!("powershell: {}", e)))?;

        if !output.status.success() {
            return Err(PlatformError::Transient(format!(
                "console user query failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Empty output means the console is unattended.
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn enable_debug_privilege(&self) -> Result<(), PlatformError> {
        let ps_script = r#"
        $signature = @"
        [DllImport("advapi32.dll", SetLastError = true)]
        public static extern bool OpenProcessToken(IntPtr ProcessHandle, uint DesiredAccess, out IntPtr TokenHandle);
        [DllImport("advapi32.dll", SetLastError = true)]
        public static extern bool LookupPrivilegeValue(string lpSystemName, string lpName, out long lpLuid);
        [StructLayout(LayoutKind.Sequential)]
        public struct TOKEN_PRIVILEGES { public uint PrivilegeCount; public long Luid; public uint Attributes; }
        [DllImport("advapi32.dll", SetLastError = true)]
        public static extern bool AdjustTokenPrivileges(IntPtr TokenHandle, bool DisableAllPrivileges, ref TOKEN_PRIVILEGES NewState, uint BufferLength, IntPtr PreviousState, IntPtr ReturnLength);
"@
        $advapi = Add-Type -MemberDefinition $signature -Name 'TokenAdjust' -Namespace 'Win32' -UsingNamespace 'System.Runtime.InteropServices' -PassThru
        $token = [IntPtr]::Zero
        $proc = [System.Diagnostics.Process]::GetCurrentProcess().Handle
        if (-not $advapi::OpenProcessToken($proc, 0x28, [ref]$token)) { Write-Output "FAILED:token"; exit }
        $luid = 0
        if (-not $advapi::LookupPrivilegeValue($null, "SeDebugPrivilege", [ref]$luid)) { Write-Output "FAILED:luid"; exit }
        $priv = New-Object Win32.TokenAdjust+TOKEN_PRIVILEGES
        $priv.PrivilegeCount = 1
        $priv.Luid = $luid
        $priv.Attributes = 0x2
        if ($advapi::AdjustTokenPrivileges($token, $false, [ref]$priv, 0, [IntPtr]::Zero, [IntPtr]::Zero)) {
            Write-Output "SUCCESS"
        } else {
            Write-Output "FAILED:adjust"
        }
        "#;

        let output = Command::new("powershell")
            .args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", ps_script])
            .output()
            .map_err(|e| PlatformError::Transient(format!("powershell: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.contains("SUCCESS") {
            Ok(())
        } else {
            Err(PlatformError::Denied(format!(
                "SeDebugPrivilege not granted: {}",
                stdout
            )))
        }
    }
}
