//! Router-group save/validation logic shared by both back-ends.

use routemux_core::{ReservablePorts, RouterGroup, RoutingError, RoutingResult, TcpRouteMapping};

/// Outcome of preparing a `save_router_group` call.
#[derive(Debug)]
pub(crate) enum GroupSave {
    Insert(RouterGroup),
    Update(RouterGroup),
}

/// Apply the field-level merge and validate the result.
///
/// `group_type` is immutable: a non-empty incoming type that differs from
/// the stored one is rejected before anything else.
pub(crate) fn prepare_group_save(
    existing: Option<RouterGroup>,
    incoming: RouterGroup,
) -> RoutingResult<GroupSave> {
    if incoming.guid.is_empty() {
        return Err(RoutingError::Invalid(
            "Router group guid cannot be empty".to_string(),
        ));
    }

    match existing {
        Some(mut current) => {
            if !incoming.group_type.is_empty() && incoming.group_type != current.group_type {
                return Err(RoutingError::Invalid(
                    "Router group type cannot be updated".to_string(),
                ));
            }
            current.merge_from(&incoming);
            current.validate()?;
            Ok(GroupSave::Update(current))
        }
        None => {
            incoming.validate()?;
            Ok(GroupSave::Insert(incoming))
        }
    }
}

/// Reject a reservable-range change that would orphan live mappings.
pub(crate) fn check_no_orphaned_ports(
    group: &RouterGroup,
    mapped_ports: impl IntoIterator<Item = u16>,
) -> RoutingResult<()> {
    let ports = ReservablePorts::parse(&group.reservable_ports)?;
    for port in mapped_ports {
        if !ports.contains(port) {
            return Err(RoutingError::InUse(format!(
                "cannot update router group '{}': port {} is still mapped by existing tcp routes",
                group.guid, port
            )));
        }
    }
    Ok(())
}

/// Referential-integrity check for a TCP upsert: the referenced group must
/// exist and reserve the external port.
pub(crate) fn check_reservable(
    group: Option<&RouterGroup>,
    mapping: &TcpRouteMapping,
) -> RoutingResult<()> {
    let group = group.ok_or_else(|| {
        RoutingError::RefIntegrity(format!(
            "router group '{}' does not exist",
            mapping.router_group_guid
        ))
    })?;

    let ports = ReservablePorts::parse(&group.reservable_ports)?;
    if !ports.contains(mapping.external_port) {
        return Err(RoutingError::RefIntegrity(format!(
            "port {} is not reservable in router group '{}'",
            mapping.external_port, group.guid
        )));
    }
    Ok(())
}
