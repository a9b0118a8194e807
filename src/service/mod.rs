use crate::{Config, Result};

pub mod bus;
pub mod connectors;
pub mod globals;
pub mod presence;
pub mod rate_limit;
pub mod rooms;
pub mod sessions;
pub mod typing;

pub struct Services {
    pub globals: globals::Service,
    pub presence: presence::Service,
    pub typing: typing::Service,
    pub rooms: rooms::Service,
    pub rate_limit: rate_limit::Service,
    pub sessions: sessions::Service,
    pub bus: bus::Service,
    pub connectors: connectors::Service,
}

impl Services {
    pub fn build<
        D: presence::Data
            + typing::Data
            + rooms::Data
            + rate_limit::Data
            + bus::Data
            + 'static,
    >(
        db: &'static D,
        config: Config,
    ) -> Result<Self> {
        Ok(Self {
            presence: presence::Service::build(db)?,
            typing: typing::Service::build(db)?,
            rooms: rooms::Service { db },
            rate_limit: rate_limit::Service { db },
            sessions: sessions::Service::build()?,
            bus: bus::Service { db },
            connectors: connectors::Service::build(&config)?,

            globals: globals::Service::load(config)?,
        })
    }
}
