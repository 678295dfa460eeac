//! Dispatch table from link addresses to link handlers

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, warn};
use url::Url;

use crate::{connection::ConnectionContext, error::LinkError};

use super::{AttachedLink, LinkDirection, LinkHandler, LinkType, UriPathTemplate};

/// Base used to resolve addresses given as bare paths
const BASE_ADDRESS: &str = "amqps://localhost/";

/// A row of the dispatch table
#[derive(Debug, Clone)]
pub struct LinkRoute {
    pub direction: LinkDirection,
    pub template: UriPathTemplate,
    pub link_type: LinkType,
}

/// Link address resolved against the dispatch table
#[derive(Debug, Clone)]
pub struct ResolvedAddress {
    pub request_uri: Url,
    pub link_type: LinkType,
    pub bound_variables: HashMap<String, String>,
}

/// Creates [`LinkHandler`]s for attached links. The first route whose direction and template
/// match the link address wins.
#[derive(Debug, Clone)]
pub struct LinkHandlerProvider {
    routes: Vec<LinkRoute>,
}

impl Default for LinkHandlerProvider {
    fn default() -> Self {
        use LinkDirection::{Receiving, Sending};

        let routes = [
            (Receiving, "/$cbs", LinkType::Cbs),
            (Sending, "/$cbs", LinkType::Cbs),
            (Receiving, "/devices/{deviceId}/messages/events", LinkType::Events),
            (
                Receiving,
                "/devices/{deviceId}/modules/{moduleId}/messages/events",
                LinkType::Events,
            ),
            (
                Sending,
                "/devices/{deviceId}/messages/deviceBound",
                LinkType::DeviceBound,
            ),
            (
                Sending,
                "/devices/{deviceId}/modules/{moduleId}/messages/events",
                LinkType::ModuleMessages,
            ),
            (
                Sending,
                "/devices/{deviceId}/methods/deviceBound",
                LinkType::MethodInvoke,
            ),
            (
                Sending,
                "/devices/{deviceId}/modules/{moduleId}/methods/deviceBound",
                LinkType::MethodInvoke,
            ),
            (
                Receiving,
                "/devices/{deviceId}/methods/deviceBound",
                LinkType::MethodResponse,
            ),
            (
                Receiving,
                "/devices/{deviceId}/modules/{moduleId}/methods/deviceBound",
                LinkType::MethodResponse,
            ),
            (Receiving, "/devices/{deviceId}/twin", LinkType::TwinReceiving),
            (
                Receiving,
                "/devices/{deviceId}/modules/{moduleId}/twin",
                LinkType::TwinReceiving,
            ),
            (Sending, "/devices/{deviceId}/twin", LinkType::TwinSending),
            (
                Sending,
                "/devices/{deviceId}/modules/{moduleId}/twin",
                LinkType::TwinSending,
            ),
        ];

        routes
            .into_iter()
            .fold(Self::empty(), |provider, (direction, template, link_type)| {
                provider.with_route(direction, template, link_type)
            })
    }
}

impl LinkHandlerProvider {
    /// A provider without any route
    pub fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    /// Appends a route to the table
    pub fn with_route(
        mut self,
        direction: LinkDirection,
        template: impl Into<String>,
        link_type: LinkType,
    ) -> Self {
        self.routes.push(LinkRoute {
            direction,
            template: UriPathTemplate::new(template),
            link_type,
        });
        self
    }

    pub fn routes(&self) -> &[LinkRoute] {
        &self.routes
    }

    /// Resolves a link address, either absolute (`amqps://host/path`) or a bare path
    pub fn resolve(
        &self,
        direction: LinkDirection,
        address: &str,
    ) -> Result<ResolvedAddress, LinkError> {
        let request_uri = parse_address(address)?;
        self.routes
            .iter()
            .filter(|route| route.direction == direction)
            .find_map(|route| {
                route
                    .template
                    .match_path(request_uri.path())
                    .map(|bound_variables| (route.link_type, bound_variables))
            })
            .map(|(link_type, bound_variables)| ResolvedAddress {
                request_uri: request_uri.clone(),
                link_type,
                bound_variables,
            })
            .ok_or_else(|| LinkError::UnknownAddress(address.to_string()))
    }

    /// Creates the handler of an attached link. A link that cannot be resolved is detached
    /// with the corresponding error before the error is returned.
    pub async fn create(
        &self,
        link: AttachedLink,
        address: &str,
        context: Arc<ConnectionContext>,
    ) -> Result<Arc<LinkHandler>, LinkError> {
        let resolved = self
            .resolve(link.direction(), address)
            .and_then(|resolved| LinkHandler::validate(&resolved).map(|_| resolved));
        match resolved {
            Ok(resolved) => {
                debug!(link = link.name(), %address, link_type = ?resolved.link_type, "Creating link handler");
                Ok(Arc::new(LinkHandler::new(link, resolved, context)))
            }
            Err(err) => {
                warn!(link = link.name(), %address, %err, "Refusing link");
                if let Err(close_err) = link.close(Some(err.to_amqp_error())).await {
                    debug!(%close_err, "Failed to detach refused link");
                }
                Err(err)
            }
        }
    }
}

fn parse_address(address: &str) -> Result<Url, LinkError> {
    let invalid = |_| LinkError::InvalidAddress(address.to_string());
    match Url::parse(address) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(BASE_ADDRESS)
            .and_then(|base| base.join(address))
            .map_err(invalid),
        Err(err) => Err(invalid(err)),
    }
}
