//! Per-(server type, plan) resource selection and image definitions.
//!
//! Two families are recognized: modded servers (anything Forge based) get
//! more memory per tier and a definition that runs the Forge installer at
//! build time; every other type is standard and runs the jar directly.

use crate::types::{GAME_PORT, Plan, ProvisionRequest, ResourceSettings, ServerType};
use crate::{Error, Result};

const MIB: i64 = 1024 * 1024;
const GIB: i64 = 1024 * MIB;

/// Headroom left between the JVM heap and the container ceiling.
const HEAP_HEADROOM: i64 = 256 * MIB;
/// Gap between initial and maximum heap.
const HEAP_SPREAD: i64 = 512 * MIB;
const HEAP_FLOOR: i64 = 512 * MIB;

/// Start script copied into every image. Renders `server.properties` from
/// the container environment, then launches either the Forge `run.sh` or the
/// plain jar.
pub const LAUNCH_SCRIPT: &str = r#"#!/bin/sh
set -e
cd /server

cat > server.properties <<EOF
motd=${SERVER_NAME:-A Minecraft Server}
difficulty=${DIFFICULTY:-normal}
online-mode=${ONLINE_MODE:-true}
max-players=${MAX_PLAYERS:-20}
server-port=25565
EOF

if [ -f run.sh ]; then
    exec bash run.sh nogui
fi
exec java -Xms"$JAVA_XMS" -Xmx"$JAVA_XMX" -jar server.jar nogui
"#;

const STANDARD_DEFINITION: &str = r#"FROM alpine:latest

RUN apk add --no-cache openjdk21-jre bash

WORKDIR /server

COPY @JAR@ /server/server.jar
COPY start.sh /server/start.sh

RUN echo "eula=true" > eula.txt && chmod +x /server/start.sh

ENV JAVA_XMS=@XMS@ JAVA_XMX=@XMX@

EXPOSE @PORT@

CMD ["sh", "/server/start.sh"]
"#;

const MODDED_DEFINITION: &str = r#"FROM alpine:latest

RUN apk add --no-cache openjdk21-jre bash

WORKDIR /server

COPY @JAR@ /server/forge-installer.jar
COPY start.sh /server/start.sh

RUN echo "eula=true" > eula.txt && chmod +x /server/start.sh

RUN java -jar forge-installer.jar --installServer && rm -f forge-installer.jar forge-installer.jar.log

RUN echo "-Xms@XMS@" > user_jvm_args.txt && echo "-Xmx@XMX@" >> user_jvm_args.txt

ENV JAVA_XMS=@XMS@ JAVA_XMX=@XMX@

EXPOSE @PORT@

CMD ["sh", "/server/start.sh"]
"#;

/// Upper player bound and suggested memory, smallest first.
const STANDARD_SIZING: [(u32, &str); 4] = [(10, "2GB"), (30, "4GB"), (50, "6GB"), (100, "8GB")];
const MODDED_SIZING: [(u32, &str); 4] = [(10, "4GB"), (30, "6GB"), (50, "8GB"), (100, "12GB")];

/// Largest player count a recommendation is offered for.
pub const MAX_RECOMMENDED_PLAYERS: u32 = 100;

/// Path of the jar inside the image build context.
pub fn jar_context_path(server_type: &str, version: &str) -> String {
    format!("assets/executables/{server_type}-{version}.jar")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFamily {
    Standard,
    Modded,
}

impl ServerFamily {
    pub fn of(server_type: &str) -> Self {
        if server_type.to_ascii_lowercase().contains("forge") {
            Self::Modded
        } else {
            Self::Standard
        }
    }

    fn ceiling(&self, plan: Plan) -> i64 {
        match (self, plan) {
            (Self::Standard, Plan::Free) => GIB,
            (Self::Standard, Plan::Budget) => 2 * GIB,
            (Self::Standard, Plan::Premium) => 4 * GIB,
            (Self::Modded, Plan::Free) => 2 * GIB,
            (Self::Modded, Plan::Budget) => 4 * GIB,
            (Self::Modded, Plan::Premium) => 6 * GIB,
        }
    }

    fn sizing(&self) -> &'static [(u32, &'static str)] {
        match self {
            Self::Standard => &STANDARD_SIZING,
            Self::Modded => &MODDED_SIZING,
        }
    }

    fn template(&self) -> &'static str {
        match self {
            Self::Standard => STANDARD_DEFINITION,
            Self::Modded => MODDED_DEFINITION,
        }
    }
}

fn cpus(plan: Plan) -> f64 {
    match plan {
        Plan::Free => 0.5,
        Plan::Budget => 1.0,
        Plan::Premium => 2.0,
    }
}

/// Heap size in the `-Xmx` notation, using `G` when it divides evenly.
fn heap_flag(bytes: i64) -> String {
    if bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else {
        format!("{}M", bytes / MIB)
    }
}

/// Stateless lookup from (server type, plan) to resources and image definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourcePolicy;

impl ResourcePolicy {
    /// Unknown plans fall back to the free tier; unknown types are standard.
    pub fn resolve(&self, server_type: &str, plan: &str) -> ResourceSettings {
        let family = ServerFamily::of(server_type);
        let plan = Plan::from_id_or_default(plan);
        let ceiling = family.ceiling(plan);

        let max = (ceiling - HEAP_HEADROOM).max(HEAP_FLOOR).min(ceiling);
        let min = (max - HEAP_SPREAD).max(HEAP_FLOOR).min(max);

        ResourceSettings {
            min_heap: heap_flag(min),
            max_heap: heap_flag(max),
            memory_bytes: ceiling,
            cpus: cpus(plan),
        }
    }

    /// Suggested memory size (e.g. `"4GB"`) for `players` concurrent players.
    pub fn recommend_memory(&self, server_type: ServerType, players: u32) -> Result<&'static str> {
        if players < 1 {
            return Err(Error::Invalid("player_count must be at least 1".into()));
        }
        ServerFamily::of(server_type.as_str())
            .sizing()
            .iter()
            .find(|(max_players, _)| players <= *max_players)
            .map(|(_, memory)| *memory)
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "no recommendation above {MAX_RECOMMENDED_PLAYERS} players"
                ))
            })
    }

    /// Image definition (Dockerfile) for the request's type, version and plan.
    pub fn generate_definition(&self, request: &ProvisionRequest) -> String {
        let settings = self.resolve(&request.server_type, &request.plan_type);
        let family = ServerFamily::of(&request.server_type);

        family
            .template()
            .replace(
                "@JAR@",
                &jar_context_path(&request.server_type, &request.server_version),
            )
            .replace("@XMS@", &settings.min_heap)
            .replace("@XMX@", &settings.max_heap)
            .replace("@PORT@", &GAME_PORT.to_string())
    }
}
