use domain::announcement::AnnouncementService;
use events::{DomainEvent, EventPublisher, HandlerError};
use gateway::{Command, Gateway, GatewayEventHandler, InboundMessage};
use log::*;
use service::{config::Config, logging::Logger};
use std::sync::Arc;

mod sse_bridge;

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to install logger: {e}");
    }

    let publisher = EventPublisher::new();
    publisher.register_fn("broadcast-log", log_broadcast);
    let announcements = AnnouncementService::new(publisher.clone());

    let consumer_service = announcements.clone();
    let gateway = match Gateway::start(
        config.gateway_settings(),
        Arc::new(move |message: InboundMessage| on_inbound(&consumer_service, message)),
    ) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to start announcement gateway: {e}");
            std::process::exit(1);
        }
    };
    publisher.register(Arc::new(GatewayEventHandler::new(gateway.broadcaster())));

    info!(
        "Announcement gateway listening on {} ({} sink(s) registered)",
        gateway.local_addr(),
        publisher.handler_count()
    );

    let bridge = config.sse_url().map(|url| {
        info!("Mirroring upstream announcements from {url}");
        sse_bridge::spawn(url.to_owned(), publisher.clone())
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {e}");
    }

    info!("Shutting down announcement gateway...");
    if let Some(bridge) = bridge {
        bridge.abort();
    }
    // close() blocks for at most the configured shutdown timeout.
    if let Err(e) = tokio::task::spawn_blocking(move || gateway.close()).await {
        error!("Gateway shutdown task failed: {e}");
    }
    info!(
        "Gateway stopped after {} announcement(s)",
        announcements.all().len()
    );
}

fn on_inbound(announcements: &AnnouncementService, message: InboundMessage) {
    match message.command {
        Command::Post {
            author,
            title,
            content,
        } => {
            debug!("POST from {} ({})", message.peer, message.session);
            announcements.create_announcement(author, title, content);
        }
    }
}

fn log_broadcast(event: &DomainEvent) -> Result<(), HandlerError> {
    match event {
        DomainEvent::AnnouncementCreated { announcement } => {
            info!(
                "Broadcasting announcement #{}: {} by {}",
                announcement.id, announcement.title, announcement.author
            );
        }
    }
    Ok(())
}
