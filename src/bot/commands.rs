use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        playlist_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        loop_command(),
        volume_command(),
        queue_command(),
        leave_command(),
    ]
}

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

// Comandos de reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Agrega un video de YouTube a la cola")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "ID o URL del video",
            )
            .required(true),
        )
}

fn playlist_command() -> CreateCommand {
    CreateCommand::new("playlist")
        .description("Importa una playlist de YouTube a la cola")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "url", "URL o ID de la playlist")
                .required(true),
        )
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta la canción actual")
}

// Comandos de cola

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Repite la cola completa")
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "enabled",
            "Activar o desactivar (alterna si se omite)",
        ))
}

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Ajusta el volumen")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "level", "Volumen (0-100)")
                .required(true)
                .min_int_value(0)
                .max_int_value(100),
        )
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue").description("Muestra la cola de reproducción")
}

// Comandos de conexión

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Desconecta el bot del canal de voz")
}
