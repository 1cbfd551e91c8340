use std::rc::Rc;

use glow::HasContext;

use crate::error::DeviceError;

pub const ATTRIB_POSITION: u32 = 0;
pub const ATTRIB_TEXCOORD: u32 = 1;

pub const VERTEX_SHADER_SRC: &str = r#"
attribute vec2 pos;
attribute vec2 texcoord;
uniform mat4 matrix;
varying vec2 v_texcoord;
void main() {
    gl_Position = matrix * vec4(pos, 0.0, 1.0);
    v_texcoord = texcoord;
}
"#;

pub const RGBA_FRAGMENT_SHADER_SRC: &str = r#"
precision mediump float;
varying vec2 v_texcoord;
uniform sampler2D tex;
uniform float alpha;
void main() {
    gl_FragColor = texture2D(tex, v_texcoord) * alpha;
}
"#;

pub const EXTERNAL_FRAGMENT_SHADER_SRC: &str = r#"
#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 v_texcoord;
uniform samplerExternalOES tex;
uniform float alpha;
void main() {
    gl_FragColor = texture2D(tex, v_texcoord) * alpha;
}
"#;

// Luma from an R8 image, chroma from a GR88 image at half resolution.
// BT.601 limited range.
pub const YUV_FRAGMENT_SHADER_SRC: &str = r#"
precision mediump float;
varying vec2 v_texcoord;
uniform sampler2D tex;
uniform sampler2D tex_uv;
uniform float alpha;
void main() {
    float y = 1.16438356 * (texture2D(tex, v_texcoord).r - 0.0625);
    vec2 uv = texture2D(tex_uv, v_texcoord).rg - vec2(0.5, 0.5);
    vec3 rgb = vec3(
        y + 1.59602678 * uv.y,
        y - 0.39176229 * uv.x - 0.81296764 * uv.y,
        y + 2.01723214 * uv.x);
    gl_FragColor = vec4(clamp(rgb, 0.0, 1.0), 1.0) * alpha;
}
"#;

/// Linked program with the uniform locations every draw sets.
pub struct ShaderProgram {
    gl: Rc<glow::Context>,
    pub program: glow::Program,
    pub matrix: Option<glow::UniformLocation>,
    pub alpha: Option<glow::UniformLocation>,
    pub tex: Option<glow::UniformLocation>,
    pub tex_uv: Option<glow::UniformLocation>,
}

fn compile(gl: &glow::Context, source: &str, shader_type: u32) -> Result<glow::Shader, DeviceError> {
    let name = if shader_type == glow::VERTEX_SHADER {
        "vertex shader"
    } else {
        "fragment shader"
    };
    let shader = unsafe { gl.create_shader(shader_type) }.map_err(|e| DeviceError::ShaderCompilation {
        shader_type: name.to_string(),
        error_log: e,
    })?;
    unsafe {
        gl.shader_source(shader, source);
        gl.compile_shader(shader);
        if !gl.get_shader_compile_status(shader) {
            let error_log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(DeviceError::ShaderCompilation {
                shader_type: name.to_string(),
                error_log,
            });
        }
    }
    Ok(shader)
}

impl ShaderProgram {
    pub fn new(gl: Rc<glow::Context>, fragment_src: &str) -> Result<Self, DeviceError> {
        let vertex = compile(&gl, VERTEX_SHADER_SRC, glow::VERTEX_SHADER)?;
        let fragment = match compile(&gl, fragment_src, glow::FRAGMENT_SHADER) {
            Ok(fragment) => fragment,
            Err(e) => {
                unsafe { gl.delete_shader(vertex) };
                return Err(e);
            }
        };

        let program = unsafe {
            let program = gl.create_program().map_err(DeviceError::ShaderLink)?;
            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.bind_attrib_location(program, ATTRIB_POSITION, "pos");
            gl.bind_attrib_location(program, ATTRIB_TEXCOORD, "texcoord");
            gl.link_program(program);
            gl.detach_shader(program, vertex);
            gl.detach_shader(program, fragment);
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);
            if !gl.get_program_link_status(program) {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(DeviceError::ShaderLink(log));
            }
            program
        };

        let (matrix, alpha, tex, tex_uv) = unsafe {
            (
                gl.get_uniform_location(program, "matrix"),
                gl.get_uniform_location(program, "alpha"),
                gl.get_uniform_location(program, "tex"),
                gl.get_uniform_location(program, "tex_uv"),
            )
        };
        Ok(Self {
            gl,
            program,
            matrix,
            alpha,
            tex,
            tex_uv,
        })
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        unsafe {
            self.gl.delete_program(self.program);
        }
    }
}
