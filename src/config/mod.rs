pub mod rules;

pub use rules::{
    CustomConfigBuilder, RulesConfig, ENV_BYPASS_BBR_LOOKBACK, ENV_BYPASS_NOTE_VALIDATION, ENV_BYPASS_VERSION_LOCK,
};
