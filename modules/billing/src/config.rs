use std::env;

/// Storage backend selection. Memory is for tests and local development;
/// Postgres is the production backend and requires DATABASE_URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    Memory,
}

/// Payment gateway selection. Mock never talks to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayType {
    Whop,
    Mock,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_type: StoreType,
    pub gateway_type: GatewayType,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub webhook_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let store_type = match env::var("STORE_TYPE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreType::Postgres,
            "memory" => StoreType::Memory,
            other => return Err(format!("Invalid STORE_TYPE: {}. Must be 'postgres' or 'memory'", other).into()),
        };

        let gateway_type = match env::var("GATEWAY_TYPE")
            .unwrap_or_else(|_| "whop".to_string())
            .to_lowercase()
            .as_str()
        {
            "whop" => GatewayType::Whop,
            "mock" => GatewayType::Mock,
            other => return Err(format!("Invalid GATEWAY_TYPE: {}. Must be 'whop' or 'mock'", other).into()),
        };

        let database_url = match env::var("DATABASE_URL") {
            Ok(url) => Some(url),
            Err(_) if store_type == StoreType::Memory => None,
            Err(_) => return Err("DATABASE_URL must be set when STORE_TYPE=postgres".into()),
        };

        Ok(Self {
            store_type,
            gateway_type,
            database_url,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT").unwrap_or_else(|_| "8094".to_string()).parse()?,
            webhook_secret: env::var("WHOP_WEBHOOK_SECRET")
                .unwrap_or_else(|_| "whsec_dev".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "STORE_TYPE",
            "GATEWAY_TYPE",
            "DATABASE_URL",
            "HOST",
            "PORT",
            "WHOP_WEBHOOK_SECRET",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn memory_store_needs_no_database_url() {
        clear_env();
        std::env::set_var("STORE_TYPE", "memory");
        std::env::set_var("GATEWAY_TYPE", "mock");

        let config = Config::from_env().unwrap();
        assert_eq!(config.store_type, StoreType::Memory);
        assert_eq!(config.gateway_type, GatewayType::Mock);
        assert!(config.database_url.is_none());
        assert_eq!(config.port, 8094);
    }

    #[test]
    #[serial]
    fn postgres_store_requires_database_url() {
        clear_env();
        std::env::set_var("STORE_TYPE", "postgres");

        assert!(Config::from_env().is_err());

        std::env::set_var("DATABASE_URL", "postgres://localhost/billing");
        let config = Config::from_env().unwrap();
        assert_eq!(config.store_type, StoreType::Postgres);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/billing")
        );
    }

    #[test]
    #[serial]
    fn rejects_unknown_store_type() {
        clear_env();
        std::env::set_var("STORE_TYPE", "sqlite");
        assert!(Config::from_env().is_err());
    }
}
