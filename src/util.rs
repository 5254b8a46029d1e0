use anyhow::anyhow;
use std::any::Any;

/// Turn the payload of a caught panic into an error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn extracts_panic_messages() {
        let payload = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "job panicked: boom");

        let payload = catch_unwind(|| panic!("code {}", 42)).unwrap_err();
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "job panicked: code 42");

        let payload = catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "job panicked");
    }
}
