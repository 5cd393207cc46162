use crate::output::UserOutput;

/// Exit code 0 when the port is free, 1 when it is taken.
pub fn run_check(port: u16, host: &str, out: &dyn UserOutput) -> anyhow::Result<i32> {
    if portlease::is_port_available(port, host) {
        out.status(&format!("{}:{} is available", host, port));
        Ok(0)
    } else {
        out.status(&format!("{}:{} is in use", host, port));
        Ok(1)
    }
}
