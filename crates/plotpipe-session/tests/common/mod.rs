//! Shared helpers for session integration tests.
//!
//! The fake engine is a POSIX shell loop that speaks just enough of the
//! plotting engine's language: print redirection (`set print`,
//! `set print "-"`), string prints, a few expressions, the caret error for
//! undefined names, and some test-only verbs. `data` reads inline rows up
//! to a line holding `e`, like the engine's `plot '-'`.

#![allow(dead_code)]

use plotpipe_core::{LogSettings, SessionConfig};
use plotpipe_session::{init_tracing, Session};

pub const FAKE_ENGINE: &str = r#"
q='"'
out=2
emit() {
  if [ "$out" = 1 ]; then printf '%s\n' "$1"; else printf '%s\n' "$1" >&2; fi
}
printf 'Fake engine 1.0 ready\n' >&2
while IFS= read -r line; do
  case "$line" in
    "set print $q-$q") out=1 ;;
    'set print') out=2 ;;
    "print $q"*"$q")
      msg=${line#print $q}
      emit "${msg%$q}" ;;
    'print 1+1') emit 2 ;;
    'print pi') emit 3.14159265358979 ;;
    'print GPVAL_TERM') emit fake ;;
    'print '*undefined*)
      name=${line#print }
      printf '\n         %s\n               ^\n         %sline 0: undefined variable: %s%s\n\n' "$line" "$q" "$name" "$q" >&2 ;;
    'lines '*)
      i=1
      while [ "$i" -le "${line#lines }" ]; do emit "line $i"; i=$((i + 1)); done ;;
    'warn '*) printf '%s\n' "${line#warn }" >&2 ;;
    'sleep '*) sleep "${line#sleep }" ;;
    'data') while IFS= read -r row && [ "$row" != e ]; do :; done ;;
    'crash') exit 3 ;;
    'exit') exit 0 ;;
    *) ;;
  esac
done
"#;

/// Install test logging once; later calls are no-ops.
pub fn init_logging() {
    init_tracing(&LogSettings {
        level: "debug".to_string(),
        json: false,
    });
}

/// Configuration that runs the fake engine through `/bin/sh`.
pub fn fake_config() -> SessionConfig {
    let mut config = SessionConfig::for_program("/bin/sh");
    config.engine.args = vec!["-c".to_string(), FAKE_ENGINE.to_string()];
    config.timing.send_timeout_ms = 10_000;
    config
}

/// Start a session against the fake engine.
pub fn fake_session() -> Session {
    init_logging();
    Session::spawn(fake_config()).expect("fake engine should start")
}
