//! The fixed set of procedures the agent exposes once joined.

use std::future::Future;
use std::sync::Arc;

use common::DeviceIdentity;
use serde_json::Value;

use super::{arg_str, in_worker, inline, request, Area, Handler, Procedure, RpcError};
use crate::device::DeviceOps;
use crate::executor::LifecycleExecutor;
use crate::firewall::FirewallService;
use crate::runtime::PruneTarget;
use crate::wifi::WifiService;

/// Registration order, grouped by area.
pub const CATALOGUE: &[(Area, &str)] = &[
    (Area::Apps, "is_running"),
    (Area::Apps, "write_data"),
    (Area::Apps, "docker_remove_image"),
    (Area::Apps, "docker_tag"),
    (Area::Apps, "docker_remove_container"),
    (Area::Config, "readme"),
    (Area::Device, "agent_update"),
    (Area::Device, "system_reboot"),
    (Area::Device, "agent_restart"),
    (Area::Device, "device_handshake"),
    (Area::Device, "updater"),
    (Area::Firewall, "apply_firewall"),
    (Area::Firewall, "ufw_enable"),
    (Area::Firewall, "ufw_status"),
    (Area::Firewall, "ufw_allow"),
    (Area::Firewall, "ufw_reset"),
    (Area::Firewall, "ufw_listening"),
    (Area::Wifi, "get_wifi"),
    (Area::Wifi, "add_wifi"),
    (Area::Wifi, "scan_wifi"),
    (Area::Wifi, "remove_wifi"),
    (Area::Wifi, "restart_wifi"),
    (Area::Stats, "docker_ps"),
    (Area::Stats, "docker_logs"),
    (Area::Stats, "docker_stats"),
    (Area::Stats, "docker_images"),
    (Area::Lifecycle, "docker_pull"),
    (Area::Lifecycle, "docker_run"),
    (Area::Lifecycle, "docker_push"),
    (Area::Lifecycle, "docker_build"),
    (Area::Lifecycle, "docker_build_cancel"),
    (Area::Prune, "docker_prune_all"),
    (Area::Prune, "docker_prune_images"),
    (Area::Prune, "docker_prune_volumes"),
    (Area::Prune, "docker_prune_networks"),
    (Area::Prune, "docker_prune_containers"),
];

/// Services the handlers dispatch to.
pub struct ProcedureContext {
    pub identity: DeviceIdentity,
    pub executor: Arc<LifecycleExecutor>,
    pub firewall: Arc<FirewallService>,
    pub wifi: Arc<WifiService>,
    pub device: Arc<DeviceOps>,
}

pub fn topic(identity: &DeviceIdentity, area: Area, name: &str) -> String {
    match area {
        Area::Wifi => identity.wifi_topic(name),
        _ => identity.mgmt_topic(name),
    }
}

/// Every topic the agent registers, in registration order.
pub fn topics(identity: &DeviceIdentity) -> Vec<String> {
    CATALOGUE.iter().map(|(area, name)| topic(identity, *area, name)).collect()
}

pub fn procedures(ctx: &ProcedureContext) -> Vec<Procedure> {
    CATALOGUE
        .iter()
        .filter_map(|&(area, name)| {
            let handler = handler(ctx, name)?;
            Some(Procedure { name, topic: topic(&ctx.identity, area, name), area, handler })
        })
        .collect()
}

fn worker<T, F, Fut>(label: &'static str, target: &Arc<T>, f: F) -> Handler
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    let target = target.clone();
    in_worker(label, move |args| f(target.clone(), args))
}

fn direct<T, F, Fut>(label: &'static str, target: &Arc<T>, f: F) -> Handler
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    let target = target.clone();
    inline(label, move |args| f(target.clone(), args))
}

fn handler(ctx: &ProcedureContext, name: &'static str) -> Option<Handler> {
    let ex = &ctx.executor;
    let fw = &ctx.firewall;
    let wifi = &ctx.wifi;
    let dev = &ctx.device;
    let handler = match name {
        "is_running" => direct(name, ex, |ex, _| async move { Ok(Value::Bool(ex.is_running().await)) }),
        // [chunk, app_type, filename, container_name, total]
        "write_data" => worker(name, ex, |ex, args| async move {
            let chunk = arg_str(&args, 0, "chunk")?;
            let filename = arg_str(&args, 2, "filename")?;
            ex.write_data(&chunk, &filename).await
        }),
        "docker_remove_image" => worker(name, ex, |ex, args| async move {
            Ok(ex.remove_image(request(&args)?).await?.to_value())
        }),
        "docker_tag" => worker(name, ex, |ex, args| async move { Ok(ex.tag(request(&args)?).await?.to_value()) }),
        "docker_remove_container" => worker(name, ex, |ex, args| async move {
            Ok(ex.remove_container(request(&args)?).await?.to_value())
        }),

        "readme" => direct(name, dev, |dev, _| async move { Ok(dev.readme()) }),
        "agent_update" => worker(name, dev, |dev, _| async move { dev.update().await }),
        "system_reboot" => worker(name, dev, |dev, _| async move { dev.system_reboot().await }),
        "agent_restart" => direct(name, dev, |dev, _| async move { dev.restart().await }),
        "device_handshake" => direct(name, dev, |dev, _| async move { Ok(dev.handshake()) }),
        "updater" => worker(name, ex, |ex, args| async move { ex.run_updater(request(&args)?).await }),

        "apply_firewall" => worker(name, fw, |fw, args| async move { fw.apply(request(&args)?).await }),
        "ufw_enable" => worker(name, fw, |fw, args| async move { fw.enable(request(&args)?).await }),
        "ufw_status" => worker(name, fw, |fw, _| async move { fw.status().await }),
        "ufw_allow" => worker(name, fw, |fw, args| async move { fw.allow(request(&args)?).await }),
        "ufw_reset" => worker(name, fw, |fw, _| async move { fw.reset().await }),
        "ufw_listening" => worker(name, fw, |fw, _| async move { fw.listening().await }),

        "get_wifi" => worker(name, wifi, |wifi, _| async move { wifi.get().await }),
        "add_wifi" => worker(name, wifi, |wifi, args| async move { wifi.add(request(&args)?).await }),
        "scan_wifi" => worker(name, wifi, |wifi, _| async move { wifi.scan().await }),
        "remove_wifi" => worker(name, wifi, |wifi, args| async move { wifi.remove(request(&args)?).await }),
        "restart_wifi" => worker(name, wifi, |wifi, _| async move { wifi.restart().await }),

        "docker_ps" => worker(name, ex, |ex, _| async move { ex.ps().await }),
        "docker_logs" => worker(name, ex, |ex, args| async move { ex.logs(request(&args)?).await }),
        "docker_stats" => worker(name, ex, |ex, _| async move { ex.stats().await }),
        "docker_images" => worker(name, ex, |ex, _| async move { ex.images().await }),

        "docker_pull" => worker(name, ex, |ex, args| async move { Ok(ex.pull(request(&args)?).await?.to_value()) }),
        "docker_run" => worker(name, ex, |ex, args| async move { ex.run(request(&args)?).await }),
        "docker_push" => worker(name, ex, |ex, args| async move { Ok(ex.push(request(&args)?).await?.to_value()) }),
        "docker_build" => worker(name, ex, |ex, args| async move { Ok(ex.build(request(&args)?).await?.to_value()) }),
        "docker_build_cancel" => worker(name, ex, |ex, args| async move {
            Ok(ex.build_cancel(request(&args)?).await?.to_value())
        }),

        "docker_prune_all" => worker(name, ex, |ex, _| async move { Ok(ex.prune_all().await?.to_value()) }),
        "docker_prune_images" => worker(name, ex, |ex, _| async move { ex.prune(PruneTarget::Images).await }),
        "docker_prune_volumes" => worker(name, ex, |ex, _| async move { ex.prune(PruneTarget::Volumes).await }),
        "docker_prune_networks" => worker(name, ex, |ex, _| async move { ex.prune(PruneTarget::Networks).await }),
        "docker_prune_containers" => {
            worker(name, ex, |ex, _| async move { ex.prune(PruneTarget::Containers).await })
        }
        _ => return None,
    };
    Some(handler)
}
