// presence-common: wire types shared by the presence aggregator boundaries

pub mod protocol;
pub mod types;
